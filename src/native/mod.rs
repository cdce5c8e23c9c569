/// Native module contains the subprocess implementation of the executor,
/// confined with plain syscalls (rlimits, process groups, namespaces)
/// instead of containers.
pub mod executor;
pub mod sandbox;
