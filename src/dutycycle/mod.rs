pub mod audit;
pub mod config;
pub mod counter;
pub mod due;
pub mod launcher;
pub mod lock;
pub mod paths;
pub mod schedule;
pub mod scheduler;
pub mod sources;
pub mod tasks;
pub mod util;
pub mod warn;
