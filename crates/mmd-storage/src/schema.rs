//! SQLite schema for the master catalog.

pub(crate) const STATEMENTS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS catalog_write_lock (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        holder TEXT,
        acquired_at TEXT
    )
    "#,
    "INSERT OR IGNORE INTO catalog_write_lock (id) VALUES (1)",
    r#"
    CREATE TABLE IF NOT EXISTS master_metrics (
        metric_id TEXT PRIMARY KEY,
        metric_name TEXT NOT NULL UNIQUE,
        system_id INTEGER,
        canonical_unit TEXT,
        normal_min REAL,
        normal_max REAL,
        is_key_metric INTEGER NOT NULL DEFAULT 0,
        source TEXT,
        explanation TEXT,
        exclude_from_analysis INTEGER NOT NULL DEFAULT 0,
        review_reason TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_master_metrics_system ON master_metrics(system_id)",
    r#"
    CREATE TABLE IF NOT EXISTS master_metric_synonyms (
        synonym_id TEXT PRIMARY KEY,
        synonym_name TEXT NOT NULL,
        metric_id TEXT NOT NULL REFERENCES master_metrics(metric_id) ON DELETE CASCADE,
        notes TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_master_synonyms_metric ON master_metric_synonyms(metric_id)",
    "CREATE INDEX IF NOT EXISTS idx_master_synonyms_name ON master_metric_synonyms(synonym_name)",
    r#"
    CREATE TABLE IF NOT EXISTS master_conversion_groups (
        conversion_group_id TEXT PRIMARY KEY,
        canonical_unit TEXT,
        notes TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS master_conversion_units (
        conversion_group_id TEXT NOT NULL
            REFERENCES master_conversion_groups(conversion_group_id) ON DELETE CASCADE,
        alt_unit TEXT NOT NULL,
        to_canonical_formula TEXT,
        from_canonical_formula TEXT,
        notes TEXT,
        PRIMARY KEY (conversion_group_id, alt_unit)
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS master_conversion_members (
        conversion_group_id TEXT NOT NULL
            REFERENCES master_conversion_groups(conversion_group_id) ON DELETE CASCADE,
        metric_id TEXT NOT NULL REFERENCES master_metrics(metric_id) ON DELETE CASCADE,
        PRIMARY KEY (conversion_group_id, metric_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_master_members_metric ON master_conversion_members(metric_id)",
    r#"
    CREATE TABLE IF NOT EXISTS master_versions (
        version_id INTEGER PRIMARY KEY AUTOINCREMENT,
        change_summary TEXT NOT NULL,
        created_by TEXT,
        created_at TEXT NOT NULL,
        data_hash TEXT NOT NULL,
        added_count INTEGER NOT NULL DEFAULT 0,
        changed_count INTEGER NOT NULL DEFAULT 0,
        removed_count INTEGER NOT NULL DEFAULT 0
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS master_snapshots (
        version_id INTEGER PRIMARY KEY REFERENCES master_versions(version_id) ON DELETE CASCADE,
        batch_json TEXT NOT NULL
    )
    "#,
];
