pub mod schema;
pub mod utils;

pub use utils::{create_conn, run_migrations, with_conn, DbPool};
