use crate::prelude::*;
use crate::sink::RecordSink;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::sync::{Arc, RwLock};
use std::time::Duration;

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelData {
    Record(Box<DecodedRecord>),
    Shutdown,
}

/// Stores raw register values in a `readings` table, one row per record.
/// Rows are written by a background inserter fed from `Channels::to_database`.
#[derive(Clone, Debug)]
pub struct Database {
    config: config::Database,
    channels: Channels,
    pool: Arc<RwLock<Option<SqlitePool>>>,
    columns: Arc<Vec<String>>,
}

impl Database {
    pub fn new(config: config::Database, channels: Channels, registry: &SchemaRegistry) -> Self {
        Self {
            config,
            channels,
            pool: Arc::new(RwLock::new(None)),
            columns: Arc::new(registry.column_names()),
        }
    }

    /// Subscribe before spawning `start` so nothing published in between is lost.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelData> {
        self.channels.to_database.subscribe()
    }

    pub async fn start(&self, receiver: broadcast::Receiver<ChannelData>) -> Result<()> {
        info!("initializing database {}", self.config.url());

        self.connect().await?;
        self.migrate().await?;

        self.inserter(receiver).await?;

        info!("database loop exiting");

        Ok(())
    }

    async fn connect(&self) -> Result<()> {
        let options = SqliteConnectOptions::from_str(self.config.url())?.create_if_missing(true);

        // every connection to :memory: is its own database
        let in_memory = self.config.url().contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .min_connections(1)
            .idle_timeout(if in_memory { None } else { Some(Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(Duration::from_secs(1800)) })
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        *self.pool.write().map_err(|_| anyhow!("Failed to acquire write lock"))? = Some(pool);
        Ok(())
    }

    pub fn connection(&self) -> Result<SqlitePool> {
        match &*self.pool.read().map_err(|_| anyhow!("Failed to acquire read lock"))? {
            Some(pool) => Ok(pool.clone()),
            None => Err(file_error!("Database not connected")),
        }
    }

    async fn migrate(&self) -> Result<()> {
        let pool = self.connection()?;
        sqlx::migrate!("db/migrations").run(&pool).await?;
        Ok(())
    }

    async fn inserter(&self, mut receiver: broadcast::Receiver<ChannelData>) -> Result<()> {
        let query = self.insert_query();

        loop {
            use ChannelData::*;

            let record = match receiver.recv().await {
                Ok(Shutdown) => break,
                Ok(Record(record)) => record,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("database inserter lagged, {} records dropped", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };

            let mut backoff = 1;
            for attempt in 1..=MAX_ATTEMPTS {
                match self.insert(&query, &record).await {
                    Ok(_) => break,
                    Err(err) if attempt < MAX_ATTEMPTS => {
                        error!("INSERT failed: {:?} - retrying in {}s", err, backoff);
                        tokio::time::sleep(Duration::from_secs(backoff)).await;
                        backoff *= 2;
                    }
                    Err(err) => {
                        error!(
                            "Failed to insert {} record after {} attempts: {:?}",
                            record.station, MAX_ATTEMPTS, err
                        );
                    }
                }
            }
        }

        Ok(())
    }

    fn insert_query(&self) -> String {
        let placeholders: Vec<String> = (1..=self.columns.len() + 3).map(|i| format!("${}", i)).collect();

        format!(
            "INSERT INTO readings (station, timestamp, comm_duration, {}) VALUES ({})",
            self.columns.join(", "),
            placeholders.join(", ")
        )
    }

    async fn insert(&self, query: &str, record: &DecodedRecord) -> Result<()> {
        let pool = self.connection()?;
        let mut conn = pool.acquire().await?;

        let mut q = sqlx::query(query)
            .bind(record.station.as_str())
            .bind(record.timestamp)
            .bind(record.comm_duration);
        for index in 0..self.columns.len() {
            // missing or undecodable tokens go in as NULL
            q = q.bind(record.raw.get(index).copied().flatten());
        }

        q.persistent(true).execute(&mut *conn).await?;

        Ok(())
    }
}

/// The sink side of the database inserters. One send reaches every subscribed
/// `Database`, so a single instance serves all configured databases.
#[derive(Clone, Debug)]
pub struct DatabaseChannel {
    channels: Channels,
}

impl DatabaseChannel {
    pub fn new(channels: Channels) -> Self {
        Self { channels }
    }

    /// Tells every inserter to exit once it has drained what was sent before.
    pub fn stop(&self) {
        let _ = self.channels.to_database.send(ChannelData::Shutdown);
    }
}

impl RecordSink for DatabaseChannel {
    fn name(&self) -> &str {
        "databases"
    }

    fn publish(&self, record: &DecodedRecord) -> Result<(), PersistenceError> {
        self.channels
            .to_database
            .send(ChannelData::Record(Box::new(record.clone())))
            .map(|_| ())
            .map_err(|_| PersistenceError::Channel("no database inserter running".to_string()))
    }
}
