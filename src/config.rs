mod database;
mod reaper;
mod worker;

pub use self::database::DatabaseConfig;
pub use self::reaper::ReaperConfig;
pub use self::worker::WorkerConfig;
