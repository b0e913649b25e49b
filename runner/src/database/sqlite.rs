use super::{ConnectionError, PipelineRecord};
use crate::pipeline::PipelineState;
use chrono::{DateTime, Utc};
use parking_lot::{lock_api::ArcMutexGuard, FairMutex, RawFairMutex};
use rusqlite::{params, Connection, OptionalExtension};
use std::{path::Path, sync::Arc};
use tracing::{debug, error, info};

#[derive(Debug, Clone)]
/// Transparent, thread safe wrapper over `InnerConnection`
pub struct SharedConnection(Arc<FairMutex<InnerConnection>>);

#[derive(Debug)]
pub struct InnerConnection {
    connection: Connection,
}

impl From<rusqlite::Error> for ConnectionError {
    fn from(error: rusqlite::Error) -> Self {
        ConnectionError::SQLite(error)
    }
}

impl SharedConnection {
    pub fn new(inner_connection: InnerConnection) -> Self {
        Self(Arc::new(FairMutex::new(inner_connection)))
    }

    fn lock(&self) -> ArcMutexGuard<RawFairMutex, InnerConnection> {
        self.0.lock_arc()
    }

    /// open the state database at `path` and apply the schema
    pub fn open(path: &Path) -> Result<Self, ConnectionError> {
        let connection = Self::new(InnerConnection::open(path)?);
        connection.init()?;

        Ok(connection)
    }

    /// throwaway database, used by tests and dry runs
    pub fn in_memory() -> Result<Self, ConnectionError> {
        let connection = Self::new(InnerConnection::in_memory()?);
        connection.init()?;

        Ok(connection)
    }

    pub fn init(&self) -> Result<(), ConnectionError> {
        self.lock().init()
    }

    pub fn close(self) -> Result<(), ConnectionError> {
        match Arc::try_unwrap(self.0) {
            Ok(inner) => inner.into_inner().close(),
            // other handles keep the connection alive, it closes with the last one
            Err(_) => Ok(()),
        }
    }

    pub fn save(&self, state: &PipelineState) -> Result<bool, ConnectionError> {
        self.lock().save(state)
    }

    pub fn load(&self, run_id: &str) -> Result<Option<PipelineState>, ConnectionError> {
        self.lock().load(run_id)
    }

    pub fn load_active(&self) -> Result<Vec<PipelineRecord>, ConnectionError> {
        self.lock().records(false)
    }

    pub fn load_all(&self) -> Result<Vec<PipelineRecord>, ConnectionError> {
        self.lock().records(true)
    }
}

impl InnerConnection {
    pub fn open(path: &Path) -> Result<Self, ConnectionError> {
        debug!(path = %path.to_string_lossy(), "Opening SQLite database");

        Ok(Self {
            connection: Connection::open(path)?,
        })
    }

    pub fn in_memory() -> Result<Self, ConnectionError> {
        Ok(Self {
            connection: Connection::open_in_memory()?,
        })
    }

    pub fn init(&self) -> Result<(), ConnectionError> {
        for (counter, table) in SQL_SCHEMA.iter().enumerate() {
            match self.connection.execute(table, []) {
                Ok(_) => debug!(
                    "Applied SQL schema ({}/{SQL_SCHEMA_NUMBER})",
                    counter + 1
                ),
                Err(error) => {
                    error!(error = ?error, table = table, "Failed to apply SQL schema ({}/{SQL_SCHEMA_NUMBER}): {error}", counter + 1);

                    return Err(ConnectionError::SQLite(error));
                }
            };
        }

        Ok(())
    }

    pub fn close(mut self) -> Result<(), ConnectionError> {
        let mut counter = 0;
        while let Err((connection, error)) = self.connection.close() {
            counter += 1;
            self.connection = connection;
            error!(error = ?error, "Failed to close SQLite connection: {error}, trying again {counter}/3");

            if counter == 3 {
                return Err(ConnectionError::SQLite(error));
            }
        }

        debug!("Closed SQLite connection");

        Ok(())
    }

    /// Upsert the state of one pipeline. Terminal pipelines are archived but stay loadable, an
    /// archived row is never overwritten. Returns false if the row was archived already.
    pub fn save(&self, state: &PipelineState) -> Result<bool, ConnectionError> {
        let document = serde_json::to_string(state)?;

        let changed = self
            .connection
            .prepare_cached(
                "insert into pipelines (run_id, phase, state, archived, updated_at)
                 values (?, ?, ?, ?, ?)
                 on conflict (run_id) do update set
                    phase = excluded.phase,
                    state = excluded.state,
                    archived = excluded.archived,
                    updated_at = excluded.updated_at
                 where pipelines.archived = 0",
            )?
            .execute(params![
                state.run_id,
                state.phase.to_string(),
                document,
                state.phase.is_terminal(),
                state.updated_at.to_rfc3339(),
            ])?;

        if changed == 0 {
            debug!(
                run_id = %state.run_id,
                phase = %state.phase,
                "Pipeline is archived, state not stored"
            );
            return Ok(false);
        }
        debug!(run_id = %state.run_id, phase = %state.phase, "Stored pipeline state");

        Ok(true)
    }

    pub fn load(&self, run_id: &str) -> Result<Option<PipelineState>, ConnectionError> {
        let document: Option<String> = self
            .connection
            .prepare_cached("select state from pipelines where run_id = ?")?
            .query_row(params![run_id], |row| row.get(0))
            .optional()?;

        match document {
            Some(document) => {
                let state = serde_json::from_str(&document)?;
                info!(run_id = run_id, "Loaded pipeline state");

                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    fn records(&self, include_archived: bool) -> Result<Vec<PipelineRecord>, ConnectionError> {
        self.connection
            .prepare_cached(
                "select run_id, phase, archived, updated_at from pipelines
                 where archived = 0 or ?
                 order by updated_at, run_id",
            )?
            .query_map(params![include_archived], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .map(|row| -> Result<PipelineRecord, ConnectionError> {
                let (run_id, phase, archived, updated_at) = row?;
                let updated_at = DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(|_| ConnectionError::Timestamp(updated_at.clone()))?
                    .with_timezone(&Utc);

                Ok(PipelineRecord {
                    run_id,
                    phase,
                    archived,
                    updated_at,
                })
            })
            .collect()
    }
}

pub const SQL_SCHEMA: [&str; 1] = ["create table if not exists pipelines (
    run_id text primary key,
    phase text not null,
    state text not null,
    archived integer not null default 0,
    updated_at text not null
);"];
pub const SQL_SCHEMA_NUMBER: usize = SQL_SCHEMA.len();
