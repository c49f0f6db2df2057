// Pure classification of a container's exit code and accumulated log
// buffer into the richer status taxonomy. No I/O, no dependencies beyond
// the shared status enum, so it is exhaustively unit-testable.

use crucible_common::ExecutionStatus;

const RETRY_MARKER: &str = "retry #";
const FAILURE_MARKER_ASCII: &str = "failed";
const FAILURE_MARKER_GLYPH: &str = "\u{2717}";

/// Derives `PASSED | FAILED | UNSTABLE` from an exit code and the
/// already-ANSI-stripped log buffer. Rules are applied in order; the
/// first match wins.
pub fn classify(exit_code: i64, log_buffer: &str) -> ExecutionStatus {
    if exit_code != 0 {
        return ExecutionStatus::Failed;
    }

    let has_retry_marker = log_buffer.contains(RETRY_MARKER);
    if has_retry_marker {
        return ExecutionStatus::Unstable;
    }

    let has_failure_marker =
        log_buffer.contains(FAILURE_MARKER_ASCII) || log_buffer.contains(FAILURE_MARKER_GLYPH);
    if has_failure_marker {
        return ExecutionStatus::Failed;
    }

    ExecutionStatus::Passed
}
