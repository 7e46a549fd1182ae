use crate::{GroupId, MetaInfo, MetaInfoValue, MetaStore, OssError, OssResult};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Fragment-placement store on sqlite. Deletes are soft (a `deleted`
/// column) so reads can opt in to seeing removed files.
pub struct SqliteMetaStore {
    pub db_path: String,
    conn: Mutex<Connection>,
}

impl SqliteMetaStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> OssResult<Self> {
        let db_path = db_path.as_ref().to_string_lossy().to_string();
        debug!("SqliteMetaStore: new db path: {}", db_path);
        let conn = Connection::open(&db_path).map_err(|e| {
            warn!("SqliteMetaStore: open db failed! {}", e.to_string());
            OssError::DbError(e.to_string())
        })?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db_path,
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> OssResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            warn!("SqliteMetaStore: open in-memory db failed! {}", e.to_string());
            OssError::DbError(e.to_string())
        })?;
        Self::init_schema(&conn)?;
        Ok(Self {
            db_path: ":memory:".to_string(),
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> OssResult<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS meta_infos (
                path TEXT NOT NULL,
                frag_index INTEGER NOT NULL,
                range_start INTEGER NOT NULL,
                range_end INTEGER NOT NULL,
                is_last INTEGER NOT NULL,
                fid INTEGER NOT NULL,
                group_id INTEGER NOT NULL,
                deleted INTEGER NOT NULL DEFAULT 0,
                create_time INTEGER NOT NULL,
                update_time INTEGER NOT NULL,
                PRIMARY KEY (path, frag_index, range_start, range_end)
            )",
            [],
        )
        .map_err(|e| {
            warn!(
                "SqliteMetaStore: create meta_infos table failed! {}",
                e.to_string()
            );
            OssError::DbError(e.to_string())
        })?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_meta_infos_path ON meta_infos(path)",
            [],
        )
        .map_err(|e| {
            warn!("SqliteMetaStore: create index failed! {}", e.to_string());
            OssError::DbError(e.to_string())
        })?;
        Ok(())
    }

    fn row_to_value(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetaInfoValue> {
        Ok(MetaInfoValue {
            index: row.get::<_, i64>(0)? as u64,
            start: row.get::<_, i64>(1)? as u64,
            end: row.get::<_, i64>(2)? as u64,
            is_last: row.get::<_, bool>(3)?,
            fid: row.get::<_, i64>(4)? as u64,
            group_id: row.get::<_, i64>(5)? as GroupId,
        })
    }
}

impl MetaStore for SqliteMetaStore {
    fn store_meta_info(&self, info: &MetaInfo) -> OssResult<()> {
        let now_time = unix_timestamp();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO meta_infos
                (path, frag_index, range_start, range_end, is_last, fid, group_id, deleted, create_time, update_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?8)
             ON CONFLICT(path, frag_index, range_start, range_end) DO UPDATE SET
                 is_last = excluded.is_last,
                 fid = excluded.fid,
                 group_id = excluded.group_id,
                 deleted = 0,
                 update_time = ?8",
            params![
                info.path,
                info.value.index as i64,
                info.value.start as i64,
                info.value.end as i64,
                info.value.is_last,
                info.value.fid as i64,
                info.value.group_id as i64,
                now_time as i64,
            ],
        )
        .map_err(|e| {
            warn!("SqliteMetaStore: store meta info failed! {}", e.to_string());
            OssError::DbError(e.to_string())
        })?;
        Ok(())
    }

    fn get_file_meta_info(
        &self,
        path: &str,
        include_deleted: bool,
    ) -> OssResult<Vec<MetaInfoValue>> {
        let conn = self.conn.lock().unwrap();
        let sql = if include_deleted {
            "SELECT frag_index, range_start, range_end, is_last, fid, group_id
             FROM meta_infos WHERE path = ?1
             ORDER BY frag_index, range_start"
        } else {
            "SELECT frag_index, range_start, range_end, is_last, fid, group_id
             FROM meta_infos WHERE path = ?1 AND deleted = 0
             ORDER BY frag_index, range_start"
        };
        let mut stmt = conn.prepare(sql).map_err(|e| {
            warn!("SqliteMetaStore: prepare statement failed! {}", e.to_string());
            OssError::DbError(e.to_string())
        })?;
        let rows = stmt
            .query_map(params![path], Self::row_to_value)
            .map_err(|e| {
                warn!(
                    "SqliteMetaStore: query {} meta info failed! {}",
                    path,
                    e.to_string()
                );
                OssError::DbError(e.to_string())
            })?;
        let mut values = Vec::new();
        for row in rows {
            values.push(row.map_err(|e| OssError::DbError(e.to_string()))?);
        }
        if values.is_empty() {
            return Err(OssError::NotFound(format!("no meta info for {}", path)));
        }
        Ok(values)
    }

    fn get_fragment_meta_info(
        &self,
        path: &str,
        index: u64,
        start: u64,
        end: u64,
    ) -> OssResult<MetaInfoValue> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT frag_index, range_start, range_end, is_last, fid, group_id
                 FROM meta_infos
                 WHERE path = ?1 AND frag_index = ?2 AND range_start = ?3 AND range_end = ?4
                   AND deleted = 0",
            )
            .map_err(|e| {
                warn!("SqliteMetaStore: prepare statement failed! {}", e.to_string());
                OssError::DbError(e.to_string())
            })?;
        stmt.query_row(
            params![path, index as i64, start as i64, end as i64],
            Self::row_to_value,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => OssError::NotFound(format!(
                "fragment not found: {} index {} range {}-{}",
                path, index, start, end
            )),
            _ => {
                warn!(
                    "SqliteMetaStore: get fragment meta failed! {}",
                    e.to_string()
                );
                OssError::DbError(e.to_string())
            }
        })
    }

    fn delete_file_meta_info(&self, path: &str) -> OssResult<()> {
        let now_time = unix_timestamp();
        let conn = self.conn.lock().unwrap();
        let changed = conn
            .execute(
                "UPDATE meta_infos SET deleted = 1, update_time = ?1 WHERE path = ?2 AND deleted = 0",
                params![now_time as i64, path],
            )
            .map_err(|e| {
                warn!(
                    "SqliteMetaStore: delete file meta failed! {}",
                    e.to_string()
                );
                OssError::DbError(e.to_string())
            })?;
        if changed == 0 {
            return Err(OssError::NotFound(format!("no meta info for {}", path)));
        }
        Ok(())
    }
}
