pub const DEFAULT_TIME_BUDGET_MS: u64 = 5_000;
pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 10_000;
pub const DEFAULT_MEMORY_BYTES: u64 = 256 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

pub const MAX_CODE_SIZE_BYTES: usize = 64 * 1024;

pub const PIPELINE_CHANNEL_CAPACITY: usize = 16;
pub const STREAM_CHANNEL_CAPACITY: usize = 32;

pub const INFRASTRUCTURE_ERROR_FEEDBACK: &str =
    "Something went wrong while checking your solution. Please try again.";
pub const CANCELLED_FEEDBACK: &str = "The run was cancelled before it finished.";
pub const DEFAULT_SUCCESS_MESSAGE: &str = "Correct! Well done.";
pub const DEFAULT_FAILURE_MESSAGE: &str = "Not quite right yet.";

pub const SOLUTION_FILE_NAME: &str = "solution.py";
pub const SCRATCH_DIR_PREFIX: &str = "tutor-run-";
