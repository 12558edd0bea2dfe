/// MIGRATION 0001: Initial database schema.
pub const MIGRATION_0001: &str = r#"
-- Detection Records Table: one row per completed detection request.
CREATE TABLE IF NOT EXISTS detection_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp TEXT NOT NULL,
    face_count INTEGER NOT NULL,
    faces_data TEXT, -- JSON array of face boxes
    image_width INTEGER,
    image_height INTEGER
);
"#;
