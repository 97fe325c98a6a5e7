pub const SCHEMA: &str = r#"
-- Photos: one row per file the library knows about
CREATE TABLE IF NOT EXISTS photos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    filename TEXT NOT NULL,
    taken_at TEXT,              -- RFC 3339, NULL when the date is unknown
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_photos_taken_at ON photos(taken_at);

-- People: identities built from face detections
CREATE TABLE IF NOT EXISTS people (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_label INTEGER,      -- Label of the clustering group this identity was created for
    name TEXT,                  -- NULL until the user names it
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_people_label ON people(cluster_label);
CREATE INDEX IF NOT EXISTS idx_people_name ON people(name);

-- Pets: identities built from pet detections, one species each
CREATE TABLE IF NOT EXISTS pets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    cluster_label INTEGER,
    species TEXT NOT NULL DEFAULT 'unknown',
    name TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX IF NOT EXISTS idx_pets_label ON pets(cluster_label, species);

-- Faces: detected faces with bounding boxes and embeddings
CREATE TABLE IF NOT EXISTS faces (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    confidence REAL NOT NULL,
    embedding BLOB,             -- NULL means "no embedding", never indexed
    embedding_dim INTEGER,
    cluster_label INTEGER,      -- -1 for noise, NULL until clustered
    person_id INTEGER,
    locked INTEGER NOT NULL DEFAULT 0,      -- Manually confirmed to person_id
    suppressed INTEGER NOT NULL DEFAULT 0,  -- Excluded from automatic clustering
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE,
    FOREIGN KEY (person_id) REFERENCES people(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_faces_photo ON faces(photo_id);
CREATE INDEX IF NOT EXISTS idx_faces_person ON faces(person_id);

-- Pet detections: same shape as faces plus species
CREATE TABLE IF NOT EXISTS pet_detections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    bbox_x INTEGER NOT NULL,
    bbox_y INTEGER NOT NULL,
    bbox_w INTEGER NOT NULL,
    bbox_h INTEGER NOT NULL,
    species TEXT,
    confidence REAL NOT NULL,
    embedding BLOB,
    embedding_dim INTEGER,
    cluster_label INTEGER,
    pet_id INTEGER,
    locked INTEGER NOT NULL DEFAULT 0,
    suppressed INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE,
    FOREIGN KEY (pet_id) REFERENCES pets(id) ON DELETE SET NULL
);

CREATE INDEX IF NOT EXISTS idx_pet_detections_photo ON pet_detections(photo_id);
CREATE INDEX IF NOT EXISTS idx_pet_detections_pet ON pet_detections(pet_id);

-- Whole-image embeddings for semantic search
CREATE TABLE IF NOT EXISTS image_embeddings (
    photo_id INTEGER PRIMARY KEY,
    embedding BLOB NOT NULL,
    embedding_dim INTEGER NOT NULL,
    model_name TEXT,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

-- User tags: free text the user attached to a photo
CREATE TABLE IF NOT EXISTS user_tags (
    photo_id INTEGER NOT NULL,
    tag TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (photo_id, tag),
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_user_tags_tag ON user_tags(tag);

-- Scene tags: descriptive labels from the captioning model
CREATE TABLE IF NOT EXISTS scene_tags (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    label TEXT NOT NULL,
    confidence REAL NOT NULL,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_scene_tags_photo ON scene_tags(photo_id);

-- Objects: generic detector output
CREATE TABLE IF NOT EXISTS objects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    photo_id INTEGER NOT NULL,
    category TEXT NOT NULL,
    confidence REAL NOT NULL,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_objects_category ON objects(category);

-- Locations: reverse-geocoded place names
CREATE TABLE IF NOT EXISTS locations (
    photo_id INTEGER PRIMARY KEY,
    city TEXT,
    region TEXT,
    country TEXT,
    FOREIGN KEY (photo_id) REFERENCES photos(id) ON DELETE CASCADE
);
"#;
