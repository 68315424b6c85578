// Copyright 2025 RisingWave Labs
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Read-only view of historical table metadata at a timestamp.
//!
//! The maintainer resolves DDL barriers against the table info that was
//! current at the barrier timestamp, so every table keeps a small version
//! chain instead of a single latest snapshot.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::model::{SchemaId, TableId, Ts};
use crate::{MetaError, MetaResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TableInfo {
    pub table_id: TableId,
    pub schema_id: SchemaId,
    pub name: String,
    /// Commit timestamp of the DDL that produced this version.
    pub version: Ts,
}

/// The maintainer's read-only view of the schema history.
pub trait SchemaStore: Send + Sync {
    /// Returns the table info with the largest `version <= ts`, or
    /// `SchemaDeleted` if the table was dropped at or before `ts`.
    fn get_table_info(&self, table_id: TableId, ts: Ts) -> MetaResult<Arc<TableInfo>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DdlKind {
    CreateTable,
    UpdateTable,
    DropTable,
    TruncateTable,
}

#[derive(Clone, Debug)]
pub struct DdlEvent {
    pub kind: DdlKind,
    pub table_id: TableId,
    pub schema_id: SchemaId,
    pub table_name: String,
    pub finished_ts: Ts,
}

/// Version chain of one table.
struct VersionedTableInfo {
    infos: Vec<Arc<TableInfo>>,
    delete_version: Ts,
    initialized: bool,
    pending_ddls: Vec<DdlEvent>,
}

impl VersionedTableInfo {
    fn new() -> Self {
        Self {
            infos: Vec::new(),
            delete_version: Ts::MAX,
            initialized: false,
            pending_ddls: Vec::new(),
        }
    }

    fn get(&self, table_id: TableId, ts: Ts) -> MetaResult<Arc<TableInfo>> {
        if ts >= self.delete_version {
            return Err(MetaError::schema_deleted(table_id, ts));
        }
        let at = self.infos.partition_point(|info| info.version <= ts);
        if at == 0 {
            return Err(anyhow::anyhow!(
                "no version of table {table_id} at ts {ts}"
            )
            .into());
        }
        Ok(self.infos[at - 1].clone())
    }

    fn apply(&mut self, event: DdlEvent) {
        if let Some(last) = self.infos.last() {
            // Replayed DDL may arrive again after a reconnect. Dropping it is
            // safe because version chains only ever grow forward.
            if event.finished_ts <= last.version {
                tracing::info!(
                    table_id = event.table_id,
                    finished_ts = event.finished_ts,
                    last_version = last.version,
                    "ignored stale ddl",
                );
                return;
            }
        }
        match event.kind {
            DdlKind::CreateTable | DdlKind::UpdateTable => {
                self.infos.push(Arc::new(TableInfo {
                    table_id: event.table_id,
                    schema_id: event.schema_id,
                    name: event.table_name,
                    version: event.finished_ts,
                }));
            }
            DdlKind::DropTable | DdlKind::TruncateTable => {
                self.delete_version = event.finished_ts;
            }
        }
    }

    /// Keeps one version at or below `gc_ts` so reads at `gc_ts` stay valid.
    fn gc(&mut self, gc_ts: Ts) {
        if !self.initialized || self.infos.is_empty() {
            return;
        }
        let at = self.infos.partition_point(|info| info.version <= gc_ts);
        if at > 0 {
            self.infos.drain(..at - 1);
        }
    }
}

/// In-memory multi-version schema store.
pub struct MemorySchemaStore {
    tables: RwLock<HashMap<TableId, Arc<Mutex<VersionedTableInfo>>>>,
}

impl Default for MemorySchemaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySchemaStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
        }
    }

    fn table(&self, table_id: TableId) -> Arc<Mutex<VersionedTableInfo>> {
        if let Some(table) = self.tables.read().get(&table_id) {
            return table.clone();
        }
        self.tables
            .write()
            .entry(table_id)
            .or_insert_with(|| Arc::new(Mutex::new(VersionedTableInfo::new())))
            .clone()
    }

    /// Seeds a table from a snapshot and marks it readable, replaying DDL
    /// buffered while the snapshot was loading.
    pub fn init_table(&self, info: TableInfo) {
        let table = self.table(info.table_id);
        let mut table = table.lock();
        table.infos.push(Arc::new(info));
        for event in std::mem::take(&mut table.pending_ddls) {
            table.apply(event);
        }
        table.initialized = true;
    }

    pub fn apply_ddl(&self, event: DdlEvent) {
        let table = self.table(event.table_id);
        let mut table = table.lock();
        if !table.initialized && event.kind != DdlKind::CreateTable {
            table.pending_ddls.push(event);
            return;
        }
        if event.kind == DdlKind::CreateTable {
            table.initialized = true;
        }
        table.apply(event);
    }

    pub fn gc(&self, gc_ts: Ts) {
        for table in self.tables.read().values() {
            table.lock().gc(gc_ts);
        }
    }
}

impl SchemaStore for MemorySchemaStore {
    fn get_table_info(&self, table_id: TableId, ts: Ts) -> MetaResult<Arc<TableInfo>> {
        let Some(table) = self.tables.read().get(&table_id).cloned() else {
            return Err(anyhow::anyhow!("table {table_id} unknown to schema store").into());
        };
        let table = table.lock();
        if !table.initialized {
            return Err(anyhow::anyhow!("table {table_id} not initialized yet").into());
        }
        table.get(table_id, ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(table_id: TableId, schema_id: SchemaId, ts: Ts) -> DdlEvent {
        DdlEvent {
            kind: DdlKind::CreateTable,
            table_id,
            schema_id,
            table_name: format!("t{table_id}"),
            finished_ts: ts,
        }
    }

    fn update(table_id: TableId, schema_id: SchemaId, ts: Ts) -> DdlEvent {
        DdlEvent {
            kind: DdlKind::UpdateTable,
            ..create(table_id, schema_id, ts)
        }
    }

    #[test]
    fn test_versioned_reads() {
        let store = MemorySchemaStore::new();
        store.apply_ddl(create(1, 1, 10));
        store.apply_ddl(update(1, 1, 20));
        store.apply_ddl(update(1, 2, 30));

        assert!(store.get_table_info(1, 5).is_err());
        assert_eq!(store.get_table_info(1, 10).unwrap().version, 10);
        assert_eq!(store.get_table_info(1, 25).unwrap().version, 20);
        assert_eq!(store.get_table_info(1, 99).unwrap().schema_id, 2);
    }

    #[test]
    fn test_deleted_table() {
        let store = MemorySchemaStore::new();
        store.apply_ddl(create(1, 1, 10));
        store.apply_ddl(DdlEvent {
            kind: DdlKind::DropTable,
            ..create(1, 1, 40)
        });

        assert_eq!(store.get_table_info(1, 30).unwrap().version, 10);
        let err = store.get_table_info(1, 40).unwrap_err();
        assert!(err.is_schema_deleted());
    }

    #[test]
    fn test_stale_ddl_ignored() {
        let store = MemorySchemaStore::new();
        store.apply_ddl(create(1, 1, 10));
        store.apply_ddl(update(1, 5, 30));
        // Replay of an older event must not fork the chain.
        store.apply_ddl(update(1, 9, 30));
        store.apply_ddl(update(1, 9, 20));
        assert_eq!(store.get_table_info(1, 99).unwrap().schema_id, 5);
    }

    #[test]
    fn test_pending_ddl_applied_on_init() {
        let store = MemorySchemaStore::new();
        store.apply_ddl(update(1, 3, 50));
        assert!(store.get_table_info(1, 50).is_err());

        store.init_table(TableInfo {
            table_id: 1,
            schema_id: 1,
            name: "t1".into(),
            version: 10,
        });
        assert_eq!(store.get_table_info(1, 20).unwrap().schema_id, 1);
        assert_eq!(store.get_table_info(1, 60).unwrap().schema_id, 3);
    }

    #[test]
    fn test_gc_retains_read_floor() {
        let store = MemorySchemaStore::new();
        store.apply_ddl(create(1, 1, 10));
        store.apply_ddl(update(1, 1, 20));
        store.apply_ddl(update(1, 1, 30));
        store.gc(25);
        // Version 20 must survive so reads at 25 still resolve.
        assert_eq!(store.get_table_info(1, 25).unwrap().version, 20);
        assert!(store.get_table_info(1, 15).is_err());
    }
}
