mod def;
mod sqlite_store;
mod store;

pub use def::*;
pub use sqlite_store::*;
pub use store::*;

#[cfg(test)]
mod test_store;
