//! SQLite storage layer for envmon.
//!
//! Holds the reading history for both reading kinds and the recipient
//! directory. Timestamps are stored as Unix milliseconds.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};

use crate::ingest::ReadingStore;
use crate::model::{EnvironmentReading, EnvironmentStats, Reading, SystemReading};
use crate::notify::RecipientDirectory;

const ENVIRONMENT_COLUMNS: &str =
    "device_id, location, ts, temperature, humidity, air_quality, pressure, light_level";

const SYSTEM_COLUMNS: &str = "device_id, device_manufacturer, device_model, ts, \
     battery_percent, is_charging, cpu_load_percent, uptime_seconds, memory_used_percent, \
     memory_total_mb, memory_free_mb, brightness_percent, volume_percent, is_online, network_type";

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    /// Create a new storage instance and initialize the schema.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:envmon.db" or "sqlite::memory:")
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // An in-memory database exists per connection, so keep a single one.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        let storage = Self { pool };
        storage.initialize_schema().await?;

        Ok(storage)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS environment_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                location TEXT NOT NULL,
                ts INTEGER NOT NULL,
                temperature REAL,
                humidity REAL,
                air_quality REAL,
                pressure REAL,
                light_level REAL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_environment_device_ts
            ON environment_readings(device_id, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS system_readings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id TEXT NOT NULL,
                device_manufacturer TEXT,
                device_model TEXT,
                ts INTEGER NOT NULL,
                battery_percent REAL,
                is_charging INTEGER NOT NULL,
                cpu_load_percent REAL,
                uptime_seconds REAL,
                memory_used_percent REAL,
                memory_total_mb REAL,
                memory_free_mb REAL,
                brightness_percent REAL,
                volume_percent REAL,
                is_online INTEGER NOT NULL,
                network_type TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_system_device_ts
            ON system_readings(device_id, ts)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS recipients (
                email TEXT PRIMARY KEY,
                name TEXT,
                notifications INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ------------------------------------------------------------------------
    // Environment readings
    // ------------------------------------------------------------------------

    /// Insert an environment reading, returning its row id.
    pub async fn insert_environment(&self, reading: &EnvironmentReading) -> anyhow::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO environment_readings
                (device_id, location, ts, temperature, humidity, air_quality, pressure, light_level)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&reading.device_id)
        .bind(&reading.location)
        .bind(reading.timestamp.timestamp_millis())
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.air_quality)
        .bind(reading.pressure)
        .bind(reading.light_level)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn latest_environment(&self) -> anyhow::Result<Option<EnvironmentReading>> {
        let row = sqlx::query(&format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environment_readings ORDER BY ts DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(environment_from_row))
    }

    /// A page of readings, newest first, plus the total row count.
    pub async fn environment_page(
        &self,
        page: u32,
        limit: u32,
    ) -> anyhow::Result<(Vec<EnvironmentReading>, i64)> {
        let limit = i64::from(limit.max(1));
        let offset = i64::from(page.max(1) - 1) * limit;

        let rows = sqlx::query(&format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environment_readings \
             ORDER BY ts DESC, id DESC LIMIT ? OFFSET ?"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        let total: i64 = sqlx::query("SELECT COUNT(*) AS total FROM environment_readings")
            .fetch_one(&self.pool)
            .await?
            .get("total");

        Ok((rows.iter().map(environment_from_row).collect(), total))
    }

    /// Readings in `[start, end]`, oldest first, optionally for one device.
    pub async fn environment_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> anyhow::Result<Vec<EnvironmentReading>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENVIRONMENT_COLUMNS} FROM environment_readings \
             WHERE ts >= ? AND ts <= ? AND (? IS NULL OR device_id = ?) \
             ORDER BY ts ASC, id ASC"
        ))
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .bind(device_id)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(environment_from_row).collect())
    }

    /// Aggregate statistics over readings taken at or after `since`.
    pub async fn environment_stats(&self, since: DateTime<Utc>) -> anyhow::Result<EnvironmentStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS data_points,
                AVG(temperature) AS avg_temperature,
                AVG(humidity) AS avg_humidity,
                AVG(air_quality) AS avg_air_quality,
                AVG(pressure) AS avg_pressure,
                AVG(light_level) AS avg_light_level,
                MIN(temperature) AS min_temperature,
                MAX(temperature) AS max_temperature,
                MIN(humidity) AS min_humidity,
                MAX(humidity) AS max_humidity
            FROM environment_readings
            WHERE ts >= ?
            "#,
        )
        .bind(since.timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        let avg = |column: &str| -> f64 { row.get::<Option<f64>, _>(column).unwrap_or(0.0) };

        Ok(EnvironmentStats {
            avg_temperature: avg("avg_temperature"),
            avg_humidity: avg("avg_humidity"),
            avg_air_quality: avg("avg_air_quality"),
            avg_pressure: avg("avg_pressure"),
            avg_light_level: avg("avg_light_level"),
            data_points: row.get("data_points"),
            min_temperature: row.get("min_temperature"),
            max_temperature: row.get("max_temperature"),
            min_humidity: row.get("min_humidity"),
            max_humidity: row.get("max_humidity"),
        })
    }

    // ------------------------------------------------------------------------
    // System readings
    // ------------------------------------------------------------------------

    /// Insert a system reading, returning its row id.
    pub async fn insert_system(&self, reading: &SystemReading) -> anyhow::Result<i64> {
        let result = sqlx::query(&format!(
            "INSERT INTO system_readings ({SYSTEM_COLUMNS}) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))
        .bind(&reading.device_id)
        .bind(&reading.device_manufacturer)
        .bind(&reading.device_model)
        .bind(reading.timestamp.timestamp_millis())
        .bind(reading.battery_percent)
        .bind(reading.is_charging)
        .bind(reading.cpu_load_percent)
        .bind(reading.uptime_seconds)
        .bind(reading.memory_used_percent)
        .bind(reading.memory_total_mb)
        .bind(reading.memory_free_mb)
        .bind(reading.brightness_percent)
        .bind(reading.volume_percent)
        .bind(reading.is_online)
        .bind(&reading.network_type)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn latest_system(&self) -> anyhow::Result<Option<SystemReading>> {
        let row = sqlx::query(&format!(
            "SELECT {SYSTEM_COLUMNS} FROM system_readings ORDER BY ts DESC, id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(system_from_row))
    }

    pub async fn system_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        device_id: Option<&str>,
    ) -> anyhow::Result<Vec<SystemReading>> {
        let rows = sqlx::query(&format!(
            "SELECT {SYSTEM_COLUMNS} FROM system_readings \
             WHERE ts >= ? AND ts <= ? AND (? IS NULL OR device_id = ?) \
             ORDER BY ts ASC, id ASC"
        ))
        .bind(start.timestamp_millis())
        .bind(end.timestamp_millis())
        .bind(device_id)
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(system_from_row).collect())
    }

    /// The most recent reading from each device, ordered by device id.
    pub async fn latest_system_per_device(&self) -> anyhow::Result<Vec<SystemReading>> {
        let rows = sqlx::query(&format!(
            "SELECT {SYSTEM_COLUMNS} FROM ( \
                 SELECT *, ROW_NUMBER() OVER ( \
                     PARTITION BY device_id ORDER BY ts DESC, id DESC \
                 ) AS rn FROM system_readings \
             ) WHERE rn = 1 ORDER BY device_id"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(system_from_row).collect())
    }

    // ------------------------------------------------------------------------
    // Recipients
    // ------------------------------------------------------------------------

    /// Insert or update a recipient's notification preference.
    pub async fn upsert_recipient(
        &self,
        email: &str,
        name: Option<&str>,
        notifications: bool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recipients (email, name, notifications)
            VALUES (?, ?, ?)
            ON CONFLICT(email) DO UPDATE SET
                name = COALESCE(excluded.name, recipients.name),
                notifications = excluded.notifications
            "#,
        )
        .bind(email)
        .bind(name)
        .bind(notifications)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn timestamp_from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn environment_from_row(row: &SqliteRow) -> EnvironmentReading {
    EnvironmentReading {
        device_id: row.get("device_id"),
        location: row.get("location"),
        timestamp: timestamp_from_millis(row.get("ts")),
        temperature: row.get("temperature"),
        humidity: row.get("humidity"),
        air_quality: row.get("air_quality"),
        pressure: row.get("pressure"),
        light_level: row.get("light_level"),
    }
}

fn system_from_row(row: &SqliteRow) -> SystemReading {
    SystemReading {
        device_id: row.get("device_id"),
        device_manufacturer: row.get("device_manufacturer"),
        device_model: row.get("device_model"),
        timestamp: timestamp_from_millis(row.get("ts")),
        battery_percent: row.get("battery_percent"),
        is_charging: row.get("is_charging"),
        cpu_load_percent: row.get("cpu_load_percent"),
        uptime_seconds: row.get("uptime_seconds"),
        memory_used_percent: row.get("memory_used_percent"),
        memory_total_mb: row.get("memory_total_mb"),
        memory_free_mb: row.get("memory_free_mb"),
        brightness_percent: row.get("brightness_percent"),
        volume_percent: row.get("volume_percent"),
        is_online: row.get("is_online"),
        network_type: row.get("network_type"),
    }
}

#[async_trait]
impl ReadingStore for Storage {
    async fn persist(&self, reading: &Reading) -> anyhow::Result<i64> {
        match reading {
            Reading::Environment(r) => self.insert_environment(r).await,
            Reading::System(r) => self.insert_system(r).await,
        }
    }
}

#[async_trait]
impl RecipientDirectory for Storage {
    async fn notification_recipients(&self) -> anyhow::Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT email FROM recipients
            WHERE notifications = 1
            ORDER BY email
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("email")).collect())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    async fn setup_test_storage() -> Storage {
        Storage::new("sqlite::memory:").await.unwrap()
    }

    fn env_at(device: &str, ts: DateTime<Utc>, temperature: f64) -> EnvironmentReading {
        EnvironmentReading {
            temperature: Some(temperature),
            humidity: Some(50.0),
            air_quality: Some(40.0),
            pressure: Some(1013.0),
            light_level: Some(300.0),
            ..EnvironmentReading::new(device, ts)
        }
    }

    #[tokio::test]
    async fn test_insert_and_latest_environment() {
        let storage = setup_test_storage().await;
        assert!(storage.latest_environment().await.unwrap().is_none());

        let now = Utc::now();
        storage
            .insert_environment(&env_at("sensor-001", now - Duration::minutes(5), 20.0))
            .await
            .unwrap();
        storage
            .insert_environment(&env_at("sensor-001", now, 22.5))
            .await
            .unwrap();

        let latest = storage.latest_environment().await.unwrap().unwrap();
        assert_eq!(latest.temperature, Some(22.5));
        assert_eq!(latest.timestamp.timestamp_millis(), now.timestamp_millis());
    }

    #[tokio::test]
    async fn test_environment_range_filters_device() {
        let storage = setup_test_storage().await;
        let now = Utc::now();

        for (i, device) in ["a", "b", "a"].iter().enumerate() {
            storage
                .insert_environment(&env_at(device, now - Duration::minutes(i as i64), 20.0))
                .await
                .unwrap();
        }

        let all = storage
            .environment_range(now - Duration::hours(1), now, None)
            .await
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));

        let only_a = storage
            .environment_range(now - Duration::hours(1), now, Some("a"))
            .await
            .unwrap();
        assert_eq!(only_a.len(), 2);
    }

    #[tokio::test]
    async fn test_environment_page() {
        let storage = setup_test_storage().await;
        let now = Utc::now();

        for i in 0..5 {
            storage
                .insert_environment(&env_at("s", now - Duration::minutes(i), i as f64))
                .await
                .unwrap();
        }

        let (page, total) = storage.environment_page(2, 2).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].temperature, Some(2.0));
    }

    #[tokio::test]
    async fn test_environment_stats() {
        let storage = setup_test_storage().await;
        let now = Utc::now();

        let empty = storage.environment_stats(now - Duration::hours(1)).await.unwrap();
        assert_eq!(empty, EnvironmentStats::default());

        storage.insert_environment(&env_at("s", now, 20.0)).await.unwrap();
        storage.insert_environment(&env_at("s", now, 30.0)).await.unwrap();
        storage
            .insert_environment(&env_at("s", now - Duration::days(2), 100.0))
            .await
            .unwrap();

        let stats = storage.environment_stats(now - Duration::hours(24)).await.unwrap();
        assert_eq!(stats.data_points, 2);
        assert_eq!(stats.avg_temperature, 25.0);
        assert_eq!(stats.min_temperature, Some(20.0));
        assert_eq!(stats.max_temperature, Some(30.0));
    }

    #[tokio::test]
    async fn test_system_round_trip_and_latest_per_device() {
        let storage = setup_test_storage().await;
        let now = Utc::now();

        let older = SystemReading {
            battery_percent: Some(90.0),
            is_charging: true,
            network_type: Some("WiFi".to_string()),
            ..SystemReading::new("laptop1", now - Duration::minutes(10))
        };
        let newer = SystemReading {
            battery_percent: Some(70.0),
            ..SystemReading::new("laptop1", now)
        };
        let other = SystemReading::new("desktop", now - Duration::minutes(3));

        for r in [&older, &newer, &other] {
            storage.insert_system(r).await.unwrap();
        }

        let latest = storage.latest_system().await.unwrap().unwrap();
        assert_eq!(latest.battery_percent, Some(70.0));

        let per_device = storage.latest_system_per_device().await.unwrap();
        let devices: Vec<_> = per_device
            .iter()
            .map(|r| (r.device_id.as_str(), r.battery_percent))
            .collect();
        assert_eq!(devices, vec![("desktop", None), ("laptop1", Some(70.0))]);

        let range = storage
            .system_range(now - Duration::hours(1), now, Some("laptop1"))
            .await
            .unwrap();
        assert_eq!(range.len(), 2);
        assert!(range[0].is_charging);
        assert_eq!(range[0].network_type.as_deref(), Some("WiFi"));
    }

    #[tokio::test]
    async fn test_recipient_directory() {
        let storage = setup_test_storage().await;

        storage.upsert_recipient("b@example.com", Some("Bea"), true).await.unwrap();
        storage.upsert_recipient("a@example.com", None, true).await.unwrap();
        storage.upsert_recipient("c@example.com", None, false).await.unwrap();

        let recipients = storage.notification_recipients().await.unwrap();
        assert_eq!(recipients, vec!["a@example.com", "b@example.com"]);

        storage.upsert_recipient("a@example.com", None, false).await.unwrap();
        let recipients = storage.notification_recipients().await.unwrap();
        assert_eq!(recipients, vec!["b@example.com"]);
    }

    #[tokio::test]
    async fn test_persist_dispatches_on_kind() {
        let storage = setup_test_storage().await;
        let now = Utc::now();

        storage
            .persist(&Reading::System(SystemReading::new("laptop1", now)))
            .await
            .unwrap();

        assert!(storage.latest_environment().await.unwrap().is_none());
        assert!(storage.latest_system().await.unwrap().is_some());
    }
}
