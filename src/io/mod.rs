pub mod events;
pub mod ignore;
pub mod process;
pub mod telemetry;
pub mod watcher;
