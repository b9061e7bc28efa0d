//! Database schema definitions

pub const CREATE_QUEUE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS download_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    resource TEXT NOT NULL,
    kind TEXT NOT NULL,             -- 'url' or 'ip_path'
    source_ip TEXT NOT NULL,
    session_id TEXT NOT NULL,
    discovered_at BIGINT NOT NULL   -- unix millis
)
"#;

// Consumers read one channel in discovery order
pub const CREATE_INDEX_CHANNEL_TS: &str =
    "CREATE INDEX IF NOT EXISTS idx_queue_channel_ts ON download_queue(channel, discovered_at)";

pub const CREATE_INDEX_SOURCE_IP: &str =
    "CREATE INDEX IF NOT EXISTS idx_queue_source_ip ON download_queue(source_ip)";
