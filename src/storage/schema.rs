//! SQLite schema. Products own offers and price history (cascade delete);
//! users own favorites. `price_history` is append-only.

pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS products (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    source          TEXT NOT NULL,
    external_id     TEXT NOT NULL,
    title           TEXT NOT NULL,
    url             TEXT NOT NULL UNIQUE,
    img             TEXT,
    img_hash        TEXT,
    brand           TEXT,
    category        TEXT,
    finger          TEXT NOT NULL,
    geoid_created   TEXT,
    avg_price_30d   INTEGER,
    min_price_30d   INTEGER,
    avg_price_90d   INTEGER,
    min_price_90d   INTEGER,
    trend_30d       REAL,
    UNIQUE (source, external_id)
);
CREATE INDEX IF NOT EXISTS ix_products_finger ON products(finger);
CREATE INDEX IF NOT EXISTS ix_products_img_hash ON products(img_hash);

CREATE TABLE IF NOT EXISTS offers (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id      INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
    price           INTEGER,
    price_old       INTEGER,
    price_final     INTEGER,
    seller          TEXT,
    shipping_days   INTEGER,
    promo_flags     TEXT,
    price_in_cart   INTEGER NOT NULL DEFAULT 0,
    subscription    INTEGER NOT NULL DEFAULT 0,
    scraped_at      INTEGER NOT NULL,
    discount_pct    REAL,
    abs_saving      INTEGER,
    score           REAL,
    fake_msrp       INTEGER
);
CREATE INDEX IF NOT EXISTS ix_offers_product_time ON offers(product_id, scraped_at);
CREATE INDEX IF NOT EXISTS ix_offers_price_final ON offers(price_final);

CREATE TABLE IF NOT EXISTS price_history (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id      INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
    ts              INTEGER NOT NULL,
    price_final     INTEGER,
    seller          TEXT
);
CREATE INDEX IF NOT EXISTS ix_history_product_ts ON price_history(product_id, ts);

CREATE TABLE IF NOT EXISTS events (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    product_id      INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
    ts              INTEGER NOT NULL,
    kind            TEXT NOT NULL,
    payload         TEXT
);
CREATE INDEX IF NOT EXISTS ix_events_product_ts ON events(product_id, ts);

CREATE TABLE IF NOT EXISTS users (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    chat_id         INTEGER NOT NULL UNIQUE,
    geoid           TEXT NOT NULL DEFAULT '213',
    min_discount    INTEGER NOT NULL DEFAULT 25,
    min_score       INTEGER NOT NULL DEFAULT 70,
    filters         TEXT,
    score_weights   TEXT,
    schedule_cron   TEXT
);

CREATE TABLE IF NOT EXISTS favorites (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id         INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
    product_id      INTEGER NOT NULL REFERENCES products(id) ON DELETE CASCADE,
    created_at      INTEGER NOT NULL,
    geoid           TEXT,
    min_discount    INTEGER,
    min_score       INTEGER,
    schedule_cron   TEXT
);
CREATE INDEX IF NOT EXISTS ix_favorites_user ON favorites(user_id);
";
