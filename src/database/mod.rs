pub mod pool;

pub use pool::{connect_in_memory, create_pool, run_migrations, DatabaseError};
