//! Consumption of an image pull stream.

use berth_common::error::{BerthError, Result};
use berth_engine::engine::PullStream;
use futures::StreamExt;

/// Reads a pull stream to completion.
///
/// An error embedded in any record aborts immediately; the remaining
/// records are not read. Progress-bar updates are skipped and status or
/// stream lines are logged.
///
/// # Errors
///
/// Returns `Pull` carrying the embedded message, or the transport failure.
pub async fn drain(reference: &str, mut stream: PullStream) -> Result<()> {
    while let Some(record) = stream.next().await {
        let message = record.map_err(|e| BerthError::Pull {
            reference: reference.to_string(),
            message: e.to_string(),
        })?;

        if let Some(error) = message.error_message() {
            return Err(BerthError::Pull {
                reference: reference.to_string(),
                message: error.to_string(),
            });
        }
        if message.is_progress() {
            continue;
        }
        if message.text().is_some() {
            tracing::info!(
                reference,
                status = %message.status,
                stream = %message.stream.trim_end(),
                "pull stream"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use berth_engine::pull::PullMessage;
    use futures::stream;

    use super::*;

    fn stream_of(records: Vec<Result<PullMessage>>) -> PullStream {
        Box::pin(stream::iter(records))
    }

    #[tokio::test]
    async fn clean_stream_succeeds() {
        let records = vec![
            Ok(PullMessage::status("Pulling from library/alpine")),
            Ok(PullMessage {
                progress: "[==>   ]".into(),
                ..PullMessage::default()
            }),
            Ok(PullMessage::status("Status: Downloaded newer image")),
        ];
        drain("docker.io/library/alpine:latest", stream_of(records))
            .await
            .expect("pull succeeds");
    }

    #[tokio::test]
    async fn embedded_error_stops_reading() {
        let read = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&read);
        let records = stream::iter(vec![
            PullMessage::status("Pulling"),
            PullMessage::failure("x"),
            PullMessage::status("never read"),
        ])
        .map(move |record| {
            let _ = counter.fetch_add(1, Ordering::SeqCst);
            Ok(record)
        });

        let err = drain("ref", Box::pin(records)).await.expect_err("fails");
        match err {
            BerthError::Pull { message, .. } => assert_eq!(message, "x"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(read.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn transport_error_is_a_pull_error() {
        let records = vec![Err(BerthError::Connection {
            message: "reset".into(),
        })];
        let err = drain("ref", stream_of(records)).await.expect_err("fails");
        assert!(matches!(err, BerthError::Pull { .. }));
    }
}
