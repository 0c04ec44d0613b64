//! Concrete job kinds (C8): the building blocks the CLI's graph file
//! compiles into, and the closures-based constructors tests build on.

pub mod cleanup;
pub mod file_generating;
pub mod function_invariant;
pub mod loading;
pub mod parameter_invariant;
pub mod probe;
pub mod temp_file_generating;

pub use cleanup::CleanupJob;
pub use file_generating::FileGeneratingJob;
pub use function_invariant::FunctionInvariantJob;
pub use loading::LoadingJob;
pub use parameter_invariant::ParameterInvariantJob;
pub use probe::DownstreamNeedsMeChecker;
pub use temp_file_generating::TempFileGeneratingJob;
