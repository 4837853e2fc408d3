mod postgres_job_attempt_repository;
mod postgres_job_repository;

pub use postgres_job_attempt_repository::PostgresJobAttemptRepository;
pub use postgres_job_repository::PostgresJobRepository;
