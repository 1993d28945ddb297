//! Repository implementations for database operations.

mod aggregate_repo;
mod job_repo;
mod server_repo;

pub use aggregate_repo::AggregateRepository;
pub use job_repo::JobRepository;
pub use server_repo::ServerRepository;
