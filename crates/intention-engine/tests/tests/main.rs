mod config;
mod execution;
mod recovery;
mod resume;
