// Tee a byte stream toward the client while capturing a bounded preview of
// its head for diagnostics and persistence fallbacks.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use tokio::sync::oneshot;

pub const DEFAULT_PREVIEW_BYTES: usize = 2048;

/// Resolves to the captured preview. `None` only when the source had no
/// readable body (see [`no_preview`]).
pub type PreviewReceiver = oneshot::Receiver<Option<String>>;

/// Forward `source` unchanged while capturing up to `max_preview_bytes` of
/// its head.
///
/// The preview resolves as soon as the budget fills, or at end-of-stream
/// with whatever was captured. A source error is forwarded downstream (and
/// terminates the tee); the preview still resolves with the bytes captured
/// so far. The captured bytes are decoded lossily as UTF-8.
pub fn tee_with_preview<S, E>(
    source: S,
    max_preview_bytes: usize,
) -> (
    Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>,
    PreviewReceiver,
)
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    let (preview_tx, preview_rx) = oneshot::channel();

    let output = async_stream::stream! {
        let mut captured = BytesMut::new();
        let mut preview_tx = Some(preview_tx);
        futures::pin_mut!(source);

        while let Some(item) = source.next().await {
            match item {
                Ok(bytes) => {
                    if captured.len() < max_preview_bytes {
                        let take = (max_preview_bytes - captured.len()).min(bytes.len());
                        captured.extend_from_slice(&bytes[..take]);
                        if captured.len() >= max_preview_bytes {
                            resolve(&mut preview_tx, &captured);
                        }
                    }
                    yield Ok(bytes);
                }
                Err(err) => {
                    resolve(&mut preview_tx, &captured);
                    yield Err(err);
                    return;
                }
            }
        }

        resolve(&mut preview_tx, &captured);
    };

    (Box::pin(output), preview_rx)
}

/// Preview for a source with no readable body: resolves to `None`.
pub fn no_preview() -> PreviewReceiver {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(None);
    rx
}

fn resolve(tx: &mut Option<oneshot::Sender<Option<String>>>, captured: &BytesMut) {
    if let Some(tx) = tx.take() {
        let _ = tx.send(Some(String::from_utf8_lossy(captured).into_owned()));
    }
}
