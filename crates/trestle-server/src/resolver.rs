//! Maps exchange failures to a final response.
//!
//! | Condition | Action |
//! |---|---|
//! | not committed, timeout with a declared timeout | empty `503`, signal succeeded |
//! | not committed, anything else | empty `500`, signal succeeded |
//! | committed | no second write, signal failed with the original error |
//!
//! A failed status write resolves the signal as failed instead.

use http::StatusCode;
use trestle_core::{BridgeError, RequestId, ResponseError, ResponseWriter};
use trestle_telemetry::metrics::record_completion_timeout;

/// Returns the status the bridge synthesizes for `error`.
///
/// A timeout only maps to `503` when the dispatcher declared one; a timeout
/// surfacing any other way is treated like every other failure.
#[must_use]
pub fn failure_status(error: &BridgeError, timeout_declared: bool) -> StatusCode {
    if error.is_timeout() && timeout_declared {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// Resolves a failed exchange against its response.
///
/// Returns `Ok` when an error status went out and the exchange ended cleanly.
/// Returns the error when the response was already committed (or the client
/// is gone), in which case the response body ends with it.
pub fn resolve(
    request_id: RequestId,
    error: BridgeError,
    writer: &ResponseWriter,
    timeout_declared: bool,
) -> Result<(), BridgeError> {
    let status = failure_status(&error, timeout_declared);
    if status == StatusCode::SERVICE_UNAVAILABLE {
        record_completion_timeout();
    }

    let signal = writer.signal();
    if !writer.is_committed() {
        match writer.send_status(status) {
            Ok(()) => {
                tracing::warn!(
                    request_id = %request_id,
                    http.status_code = status.as_u16(),
                    error = %error,
                    "request failed before the response was committed"
                );
                signal.succeed();
                return Ok(());
            }
            Err(ResponseError::Disconnected) => {
                tracing::debug!(request_id = %request_id, error = %error, "client gone before error status was sent");
                signal.fail(error.clone());
                return Err(error);
            }
            // Committed between the check and the write.
            Err(ResponseError::Committed | ResponseError::Closed) => {}
        }
    }

    trestle_telemetry::log_exchange_error!(request_id, error);
    signal.fail(error.clone());
    // A completer that won the race keeps its outcome.
    signal.outcome().unwrap_or(Err(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_LENGTH;
    use http::Method;
    use std::time::Duration;
    use trestle_core::{CompletionSignal, DispatchError, ResponseChannels};

    fn writer() -> (ResponseWriter, ResponseChannels) {
        ResponseWriter::new(&Method::GET, CompletionSignal::new())
    }

    fn timeout() -> BridgeError {
        BridgeError::TimedOut(Duration::from_millis(100))
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(failure_status(&timeout(), true), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(failure_status(&timeout(), false), StatusCode::INTERNAL_SERVER_ERROR);
        let dispatch = BridgeError::from(DispatchError::failed("boom"));
        assert_eq!(failure_status(&dispatch, true), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(failure_status(&dispatch, false), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_uncommitted_timeout_sends_503() {
        let (writer, mut channels) = writer();
        writer.set_status(StatusCode::OK).unwrap();

        resolve(RequestId::new(), timeout(), &writer, true).unwrap();

        let head = channels.head.try_recv().unwrap();
        assert_eq!(head.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(head.headers[CONTENT_LENGTH], "0");
        assert!(channels.body.try_recv().is_err());
        assert!(matches!(writer.signal().outcome(), Some(Ok(()))));
    }

    #[test]
    fn test_uncommitted_failure_sends_500() {
        let (writer, mut channels) = writer();
        let error = BridgeError::from(DispatchError::failed("boom"));

        resolve(RequestId::new(), error, &writer, false).unwrap();

        assert_eq!(channels.head.try_recv().unwrap().status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(writer.signal().is_done());
    }

    #[test]
    fn test_committed_response_is_not_written_twice() {
        let (writer, mut channels) = writer();
        writer.write("partial").unwrap();

        let result = resolve(RequestId::new(), timeout(), &writer, true);

        assert!(matches!(result, Err(BridgeError::TimedOut(_))));
        let head = channels.head.try_recv().unwrap();
        assert_eq!(head.status, StatusCode::OK);
        assert_eq!(channels.body.try_recv().unwrap(), "partial");
        assert!(matches!(writer.signal().outcome(), Some(Err(BridgeError::TimedOut(_)))));
    }

    #[test]
    fn test_late_completion_keeps_first_outcome() {
        let (writer, _channels) = writer();
        let resume = writer.suspend();
        resume.write("done").unwrap();
        resume.complete().unwrap();

        let result = resolve(RequestId::new(), timeout(), &writer, true);
        assert!(result.is_ok());
        assert!(matches!(writer.signal().outcome(), Some(Ok(()))));
    }

    #[test]
    fn test_disconnected_client_fails_signal() {
        let (writer, channels) = writer();
        drop(channels);

        let result = resolve(RequestId::new(), timeout(), &writer, true);
        assert!(result.is_err());
        assert!(matches!(writer.signal().outcome(), Some(Err(_))));
    }
}
