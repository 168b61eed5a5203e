//! SQLite-backed store for products, offers, price history, events, users and
//! favorites. One connection guarded by an async mutex; every task works in
//! its own transaction.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::Mutex;
use tracing::warn;

use crate::crypto::KeyRing;
use crate::models::{
    Event, Favorite, NormalizedOffer, Offer, Product, PromoFlags, ScoreWeightOverrides, Site,
    User,
};
use crate::processing::features::PriceStats;
use crate::storage::schema::SCHEMA;

/// Result of persisting one normalized offer.
#[derive(Debug, Clone, Copy)]
pub struct UpsertOutcome {
    pub product_id: i64,
    pub offer_id: i64,
    pub created_product: bool,
}

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    crypto: Option<KeyRing>,
}

impl Store {
    pub fn open(db_path: &str, crypto: Option<KeyRing>) -> Result<Self> {
        let conn = Connection::open(db_path).with_context(|| format!("open db {db_path}"))?;
        Self::with_connection(conn, crypto)
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory(crypto: Option<KeyRing>) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, crypto)
    }

    fn with_connection(conn: Connection, crypto: Option<KeyRing>) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA).context("apply schema")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            crypto,
        })
    }

    // ----- products / offers / history -------------------------------------

    /// Creates or refreshes the product for `item` and appends one offer and
    /// one price-history row, all in a single transaction.
    ///
    /// The product is located by URL. An existing product only ever gains an
    /// image hash; a present hash is never overwritten.
    pub async fn upsert_offer(
        &self,
        item: &NormalizedOffer,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let existing: Option<(i64, Option<String>)> = tx
            .query_row(
                "SELECT id, img_hash FROM products WHERE url = ?1",
                params![item.url],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (product_id, created_product) = match existing {
            Some((id, img_hash)) => {
                if img_hash.is_none() {
                    if let Some(h) = &item.img_hash {
                        tx.execute(
                            "UPDATE products SET img_hash = ?1 WHERE id = ?2",
                            params![h, id],
                        )?;
                    }
                }
                (id, false)
            }
            None => {
                tx.execute(
                    "INSERT INTO products (source, external_id, title, url, img, img_hash, \
                     brand, category, finger, geoid_created) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                    params![
                        item.source.as_str(),
                        item.external_id,
                        item.title,
                        item.url,
                        item.img,
                        item.img_hash,
                        item.brand,
                        item.category,
                        item.finger,
                        item.geoid,
                    ],
                )?;
                (tx.last_insert_rowid(), true)
            }
        };

        tx.execute(
            "INSERT INTO offers (product_id, price, price_old, price_final, seller, \
             shipping_days, promo_flags, price_in_cart, subscription, scraped_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                product_id,
                item.price,
                item.price_old,
                item.price_final,
                item.seller,
                item.shipping_days,
                serde_json::to_string(&item.promo_flags)?,
                item.price_in_cart,
                item.subscription,
                now.timestamp(),
            ],
        )?;
        let offer_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO price_history (product_id, ts, price_final, seller) \
             VALUES (?1, ?2, ?3, ?4)",
            params![product_id, now.timestamp(), item.price_final, item.seller],
        )?;

        tx.commit()?;
        Ok(UpsertOutcome {
            product_id,
            offer_id,
            created_product,
        })
    }

    /// Average and minimum of `price_final` over history rows with
    /// `ts >= now - days`.
    pub async fn window_stats(
        &self,
        product_id: i64,
        days: i64,
        now: DateTime<Utc>,
    ) -> Result<PriceStats> {
        let cutoff = (now - Duration::days(days)).timestamp();
        let conn = self.conn.lock().await;
        let (avg, min): (Option<f64>, Option<i64>) = conn.query_row(
            "SELECT AVG(price_final), MIN(price_final) FROM price_history \
             WHERE product_id = ?1 AND ts >= ?2 AND price_final IS NOT NULL",
            params![product_id, cutoff],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(PriceStats {
            avg: avg.map(|v| v as i64),
            min,
        })
    }

    /// Non-null history points inside the 30-day window, oldest first.
    pub async fn history_points_30d(
        &self,
        product_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<(DateTime<Utc>, i64)>> {
        let cutoff = (now - Duration::days(30)).timestamp();
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT ts, price_final FROM price_history \
             WHERE product_id = ?1 AND ts >= ?2 AND price_final IS NOT NULL \
             ORDER BY ts ASC",
        )?;
        let rows = stmt.query_map(params![product_id, cutoff], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut points = Vec::new();
        for row in rows {
            let (ts, price) = row?;
            let ts = Utc
                .timestamp_opt(ts, 0)
                .single()
                .context("timestamp out of range")?;
            points.push((ts, price));
        }
        Ok(points)
    }

    /// Persists rolling aggregates on the product row.
    pub async fn save_aggregates(
        &self,
        product_id: i64,
        stats30: PriceStats,
        stats90: PriceStats,
        trend_30d: Option<f64>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE products SET avg_price_30d = ?1, min_price_30d = ?2, \
             avg_price_90d = ?3, min_price_90d = ?4, trend_30d = ?5 WHERE id = ?6",
            params![stats30.avg, stats30.min, stats90.avg, stats90.min, trend_30d, product_id],
        )?;
        Ok(())
    }

    /// Persists derived scoring fields on one offer row.
    pub async fn save_offer_scores(
        &self,
        offer_id: i64,
        discount_pct: Option<f64>,
        abs_saving: Option<i64>,
        score: f64,
        fake_msrp: bool,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE offers SET discount_pct = ?1, abs_saving = ?2, score = ?3, fake_msrp = ?4 \
             WHERE id = ?5",
            params![discount_pct, abs_saving, score, fake_msrp, offer_id],
        )?;
        Ok(())
    }

    pub async fn product_by_url(&self, url: &str) -> Result<Option<Product>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, source, external_id, title, url, img, img_hash, brand, category, \
             finger, geoid_created, avg_price_30d, min_price_30d, avg_price_90d, \
             min_price_90d, trend_30d FROM products WHERE url = ?1",
            params![url],
            product_from_row,
        )
        .optional()
        .context("load product by url")
    }

    /// Most recent offer row for a product, with derived scoring fields.
    pub async fn latest_offer(&self, product_id: i64) -> Result<Option<Offer>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, product_id, price, price_old, price_final, seller, shipping_days, \
             promo_flags, price_in_cart, subscription, scraped_at, discount_pct, abs_saving, \
             score, fake_msrp FROM offers WHERE product_id = ?1 \
             ORDER BY scraped_at DESC, id DESC LIMIT 1",
            params![product_id],
            |row| {
                let promo_raw: Option<String> = row.get(7)?;
                Ok(Offer {
                    id: row.get(0)?,
                    product_id: row.get(1)?,
                    price: row.get(2)?,
                    price_old: row.get(3)?,
                    price_final: row.get(4)?,
                    seller: row.get(5)?,
                    shipping_days: row.get(6)?,
                    promo_flags: promo_raw
                        .and_then(|s| serde_json::from_str(&s).ok())
                        .unwrap_or_else(PromoFlags::new),
                    price_in_cart: row.get(8)?,
                    subscription: row.get(9)?,
                    scraped_at: Utc
                        .timestamp_opt(row.get::<_, i64>(10)?, 0)
                        .single()
                        .unwrap_or_else(Utc::now),
                    discount_pct: row.get(11)?,
                    abs_saving: row.get(12)?,
                    score: row.get(13)?,
                    fake_msrp: row.get(14)?,
                })
            },
        )
        .optional()
        .context("load latest offer")
    }

    pub async fn history_len(&self, product_id: i64) -> Result<i64> {
        let conn = self.conn.lock().await;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM price_history WHERE product_id = ?1",
            params![product_id],
            |row| row.get(0),
        )?)
    }

    // ----- events -----------------------------------------------------------

    pub async fn insert_event(
        &self,
        product_id: i64,
        kind: &str,
        payload: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (product_id, ts, kind, payload) VALUES (?1, ?2, ?3, ?4)",
            params![product_id, now.timestamp(), kind, serde_json::to_string(payload)?],
        )?;
        Ok(())
    }

    pub async fn events_for_product(&self, product_id: i64) -> Result<Vec<Event>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, product_id, ts, kind, payload FROM events \
             WHERE product_id = ?1 ORDER BY ts ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![product_id], |row| {
            let payload: Option<String> = row.get(4)?;
            Ok(Event {
                id: row.get(0)?,
                product_id: row.get(1)?,
                ts: Utc
                    .timestamp_opt(row.get::<_, i64>(2)?, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                kind: row.get(3)?,
                payload: payload.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    // ----- users / favorites ------------------------------------------------

    /// Inserts or replaces a user profile. Category filters and score weights
    /// are encrypted at rest when a key ring is configured.
    pub async fn upsert_user(&self, user: &User) -> Result<i64> {
        let filters = match &user.categories {
            Some(cats) => Some(self.seal(&serde_json::to_string(cats)?)?),
            None => None,
        };
        let weights = match &user.score_weights {
            Some(w) => Some(self.seal(&serde_json::to_string(w)?)?),
            None => None,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO users (chat_id, geoid, min_discount, min_score, filters, \
             score_weights, schedule_cron) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT(chat_id) DO UPDATE SET geoid = excluded.geoid, \
             min_discount = excluded.min_discount, min_score = excluded.min_score, \
             filters = excluded.filters, score_weights = excluded.score_weights, \
             schedule_cron = excluded.schedule_cron",
            params![
                user.chat_id,
                user.geoid,
                user.min_discount,
                user.min_score,
                filters,
                weights,
                user.schedule_cron,
            ],
        )?;
        Ok(conn.query_row(
            "SELECT id FROM users WHERE chat_id = ?1",
            params![user.chat_id],
            |row| row.get(0),
        )?)
    }

    pub async fn active_users(&self) -> Result<Vec<User>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, chat_id, geoid, min_discount, min_score, filters, score_weights, \
             schedule_cron FROM users",
        )?;
        let rows = stmt.query_map([], user_columns)?;
        let mut users = Vec::new();
        for row in rows {
            users.push(self.decode_user(row?));
        }
        Ok(users)
    }

    pub async fn user_by_chat(&self, chat_id: i64) -> Result<Option<User>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT id, chat_id, geoid, min_discount, min_score, filters, score_weights, \
                 schedule_cron FROM users WHERE chat_id = ?1",
                params![chat_id],
                user_columns,
            )
            .optional()?;
        Ok(row.map(|r| self.decode_user(r)))
    }

    pub async fn add_favorite(&self, favorite: &Favorite) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO favorites (user_id, product_id, created_at, geoid, min_discount, \
             min_score, schedule_cron) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                favorite.user_id,
                favorite.product_id,
                favorite.created_at.timestamp(),
                favorite.geoid,
                favorite.min_discount,
                favorite.min_score,
                favorite.schedule_cron,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub async fn favorites_for_user(&self, user_id: i64) -> Result<Vec<Favorite>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, product_id, created_at, geoid, min_discount, min_score, \
             schedule_cron FROM favorites WHERE user_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![user_id], |row| {
            Ok(Favorite {
                id: row.get(0)?,
                user_id: row.get(1)?,
                product_id: row.get(2)?,
                created_at: Utc
                    .timestamp_opt(row.get::<_, i64>(3)?, 0)
                    .single()
                    .unwrap_or_else(Utc::now),
                geoid: row.get(4)?,
                min_discount: row.get(5)?,
                min_score: row.get(6)?,
                schedule_cron: row.get(7)?,
            })
        })?;
        let mut favorites = Vec::new();
        for row in rows {
            favorites.push(row?);
        }
        Ok(favorites)
    }

    // ----- helpers ----------------------------------------------------------

    fn seal(&self, plaintext: &str) -> Result<String> {
        match &self.crypto {
            Some(ring) => ring.encrypt(plaintext),
            None => Ok(plaintext.to_string()),
        }
    }

    fn unseal(&self, stored: &str) -> Option<String> {
        match &self.crypto {
            Some(ring) => match ring.decrypt(stored) {
                Ok(plain) => Some(plain),
                Err(err) => {
                    warn!(%err, "failed to decrypt user field");
                    None
                }
            },
            None => Some(stored.to_string()),
        }
    }

    fn decode_user(&self, raw: RawUserRow) -> User {
        let categories = raw
            .filters
            .as_deref()
            .and_then(|s| self.unseal(s))
            .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok());
        let score_weights = raw
            .score_weights
            .as_deref()
            .and_then(|s| self.unseal(s))
            .and_then(|s| serde_json::from_str::<ScoreWeightOverrides>(&s).ok());
        User {
            id: raw.id,
            chat_id: raw.chat_id,
            geoid: raw.geoid,
            min_discount: raw.min_discount,
            min_score: raw.min_score,
            categories,
            score_weights,
            schedule_cron: raw.schedule_cron,
        }
    }
}

struct RawUserRow {
    id: i64,
    chat_id: i64,
    geoid: String,
    min_discount: i64,
    min_score: i64,
    filters: Option<String>,
    score_weights: Option<String>,
    schedule_cron: Option<String>,
}

fn user_columns(row: &Row<'_>) -> rusqlite::Result<RawUserRow> {
    Ok(RawUserRow {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        geoid: row.get(2)?,
        min_discount: row.get(3)?,
        min_score: row.get(4)?,
        filters: row.get(5)?,
        score_weights: row.get(6)?,
        schedule_cron: row.get(7)?,
    })
}

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    let source: String = row.get(1)?;
    Ok(Product {
        id: row.get(0)?,
        source: Site::from_str(&source).unwrap_or(Site::Ozon),
        external_id: row.get(2)?,
        title: row.get(3)?,
        url: row.get(4)?,
        img: row.get(5)?,
        img_hash: row.get(6)?,
        brand: row.get(7)?,
        category: row.get(8)?,
        finger: row.get(9)?,
        geoid_created: row.get(10)?,
        avg_price_30d: row.get(11)?,
        min_price_30d: row.get(12)?,
        avg_price_90d: row.get(13)?,
        min_price_90d: row.get(14)?,
        trend_30d: row.get(15)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PromoFlags, Site};
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine;
    use chrono::Duration;

    fn offer(url: &str, finger: &str, price_final: Option<i64>) -> NormalizedOffer {
        NormalizedOffer {
            source: Site::Ozon,
            external_id: "123".into(),
            title: "Ноутбук Lenovo".into(),
            url: url.into(),
            img: Some("https://cdn/1.jpg".into()),
            img_hash: Some("00ff00ff00ff00ff".into()),
            brand: Some("Lenovo".into()),
            category: Some("laptops".into()),
            seller: None,
            finger: finger.into(),
            price: price_final,
            price_old: None,
            price_final,
            discount_pct: None,
            shipping_days: None,
            promo_flags: PromoFlags::new(),
            shipping_included: false,
            price_in_cart: false,
            subscription: false,
            geoid: Some("213".into()),
        }
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deals.db");
        let path = path.to_str().unwrap();
        let now = Utc::now();
        {
            let store = Store::open(path, None).unwrap();
            store
                .upsert_offer(&offer("https://o/p0", "f0", Some(100)), now)
                .await
                .unwrap();
        }
        let store = Store::open(path, None).unwrap();
        let product = store.product_by_url("https://o/p0").await.unwrap().unwrap();
        assert_eq!(product.finger, "f0");
    }

    #[tokio::test]
    async fn upserting_same_url_twice_keeps_one_product_two_history_rows() {
        let store = Store::open_in_memory(None).unwrap();
        let now = Utc::now();
        let first = store
            .upsert_offer(&offer("https://o/p1", "f1", Some(100)), now)
            .await
            .unwrap();
        let second = store
            .upsert_offer(&offer("https://o/p1", "f1", Some(90)), now)
            .await
            .unwrap();
        assert!(first.created_product);
        assert!(!second.created_product);
        assert_eq!(first.product_id, second.product_id);
        assert_eq!(store.history_len(first.product_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn img_hash_is_filled_once_and_never_cleared() {
        let store = Store::open_in_memory(None).unwrap();
        let now = Utc::now();
        let mut bare = offer("https://o/p2", "f2", Some(100));
        bare.img = None;
        bare.img_hash = None;
        store.upsert_offer(&bare, now).await.unwrap();
        let product = store.product_by_url("https://o/p2").await.unwrap().unwrap();
        assert_eq!(product.img_hash, None);

        store
            .upsert_offer(&offer("https://o/p2", "f2", Some(90)), now)
            .await
            .unwrap();
        let product = store.product_by_url("https://o/p2").await.unwrap().unwrap();
        assert_eq!(product.img_hash.as_deref(), Some("00ff00ff00ff00ff"));

        // A later offer without an image must not clear the stored hash.
        store.upsert_offer(&bare, now).await.unwrap();
        let product = store.product_by_url("https://o/p2").await.unwrap().unwrap();
        assert_eq!(product.img_hash.as_deref(), Some("00ff00ff00ff00ff"));
    }

    #[tokio::test]
    async fn window_stats_honor_the_cutoff() {
        let store = Store::open_in_memory(None).unwrap();
        let now = Utc::now();
        let out = store
            .upsert_offer(&offer("https://o/p3", "f3", Some(200)), now - Duration::days(40))
            .await
            .unwrap();
        for (days, price) in [(20, 100), (10, 80), (1, 120)] {
            store
                .upsert_offer(&offer("https://o/p3", "f3", Some(price)), now - Duration::days(days))
                .await
                .unwrap();
        }
        let stats30 = store.window_stats(out.product_id, 30, now).await.unwrap();
        let stats90 = store.window_stats(out.product_id, 90, now).await.unwrap();
        assert_eq!(stats30, PriceStats { avg: Some(100), min: Some(80) });
        assert_eq!(stats90, PriceStats { avg: Some(125), min: Some(80) });

        let points = store.history_points_30d(out.product_id, now).await.unwrap();
        assert_eq!(points.len(), 3);
        assert_eq!(points[0].1, 100);
        assert_eq!(points[2].1, 120);
    }

    #[tokio::test]
    async fn aggregates_and_scores_round_trip() {
        let store = Store::open_in_memory(None).unwrap();
        let now = Utc::now();
        let out = store
            .upsert_offer(&offer("https://o/p4", "f4", Some(100)), now)
            .await
            .unwrap();
        store
            .save_aggregates(
                out.product_id,
                PriceStats { avg: Some(100), min: Some(80) },
                PriceStats { avg: Some(125), min: Some(80) },
                Some(29.89),
            )
            .await
            .unwrap();
        store
            .save_offer_scores(out.offer_id, Some(20.0), Some(30), 41.5, false)
            .await
            .unwrap();
        let product = store.product_by_url("https://o/p4").await.unwrap().unwrap();
        assert_eq!(product.avg_price_30d, Some(100));
        assert_eq!(product.min_price_90d, Some(80));
        assert_eq!(product.trend_30d, Some(29.89));
    }

    #[tokio::test]
    async fn user_fields_are_encrypted_at_rest() {
        let ring = KeyRing::from_spec(&URL_SAFE.encode([7u8; 32])).unwrap();
        let store = Store::open_in_memory(Some(ring)).unwrap();
        let user = User {
            id: 0,
            chat_id: 42,
            geoid: "2".into(),
            min_discount: 30,
            min_score: 60,
            categories: Some(vec!["phones".into()]),
            score_weights: Some(ScoreWeightOverrides {
                discount: Some(0.9),
                ..Default::default()
            }),
            schedule_cron: Some("0 9 * * *".into()),
        };
        store.upsert_user(&user).await.unwrap();

        // Raw column must not contain the plaintext.
        {
            let conn = store.conn.lock().await;
            let raw: String = conn
                .query_row("SELECT filters FROM users WHERE chat_id = 42", [], |row| {
                    row.get(0)
                })
                .unwrap();
            assert!(!raw.contains("phones"));
        }

        let loaded = store.user_by_chat(42).await.unwrap().unwrap();
        assert_eq!(loaded.categories, Some(vec!["phones".to_string()]));
        assert_eq!(loaded.score_weights.unwrap().discount, Some(0.9));
        assert_eq!(loaded.geoid, "2");
    }

    #[tokio::test]
    async fn favorites_cascade_with_their_user() {
        let store = Store::open_in_memory(None).unwrap();
        let now = Utc::now();
        let out = store
            .upsert_offer(&offer("https://o/p5", "f5", Some(100)), now)
            .await
            .unwrap();
        let user = User {
            id: 0,
            chat_id: 7,
            geoid: "213".into(),
            min_discount: 25,
            min_score: 70,
            categories: None,
            score_weights: None,
            schedule_cron: None,
        };
        let user_id = store.upsert_user(&user).await.unwrap();
        store
            .add_favorite(&Favorite {
                id: 0,
                user_id,
                product_id: out.product_id,
                created_at: now,
                geoid: None,
                min_discount: Some(10),
                min_score: None,
                schedule_cron: None,
            })
            .await
            .unwrap();
        let favs = store.favorites_for_user(user_id).await.unwrap();
        assert_eq!(favs.len(), 1);
        assert_eq!(favs[0].min_discount, Some(10));

        let conn = store.conn.lock().await;
        conn.execute("DELETE FROM users WHERE id = ?1", params![user_id])
            .unwrap();
        let left: i64 = conn
            .query_row("SELECT COUNT(*) FROM favorites", [], |row| row.get(0))
            .unwrap();
        assert_eq!(left, 0);
    }
}
