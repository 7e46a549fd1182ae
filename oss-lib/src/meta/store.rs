use crate::{MetaInfo, MetaInfoValue, OssResult};

/// Narrow driver interface to the metadata persistence engine. Concrete
/// implementations are selected at startup; the rest of the core only sees
/// this trait.
pub trait MetaStore: Send + Sync {
    fn store_meta_info(&self, info: &MetaInfo) -> OssResult<()>;
    /// All fragments of a file, ordered by fragment index then range start.
    fn get_file_meta_info(&self, path: &str, include_deleted: bool)
        -> OssResult<Vec<MetaInfoValue>>;
    fn get_fragment_meta_info(
        &self,
        path: &str,
        index: u64,
        start: u64,
        end: u64,
    ) -> OssResult<MetaInfoValue>;
    fn delete_file_meta_info(&self, path: &str) -> OssResult<()>;
}
