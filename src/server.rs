use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, BoxStream, SelectAll};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error};
use ulid::Ulid;

use crate::engine::{Engine, EngineError, ErrorKind};
use crate::limits::{MAX_LINE_LEN, MAX_WATCHES_PER_CONNECTION};
use crate::model::Change;
use crate::observability::{self, op_label};
use crate::protocol::{execute, parse_request, render, render_change, render_lagged, Request};

/// Change lines pushed to a connection, one stream per `watch`.
type Watches = SelectAll<BoxStream<'static, String>>;

/// Serve one client: read request lines, write one reply line per request.
/// Connections that `watch` also receive change lines between replies.
pub async fn process_connection<S>(socket: S, engine: Arc<Engine>) -> Result<(), LinesCodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut watches = Watches::new();
    loop {
        let line = tokio::select! {
            line = framed.next() => match line {
                Some(line) => line,
                None => break,
            },
            Some(push) = watches.next(), if !watches.is_empty() => {
                framed.send(push).await?;
                continue;
            }
        };
        let reply = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => match parse_request(&line) {
                Ok(Request::Watch { resource_id }) => start_watch(&engine, resource_id, &mut watches),
                parsed => handle_request(&engine, parsed).await,
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                framed
                    .send(render(Err(EngineError::LimitExceeded("request line too long"))))
                    .await?;
                // A framed stream ends after a decode error. Rebuild it: the
                // codec skips to the next newline and the connection carries on.
                framed = Framed::from_parts(framed.into_parts());
                continue;
            }
            Err(e) => return Err(e),
        };
        framed.send(reply).await?;
    }
    Ok(())
}

/// Render changes from `rx` until the channel closes.
fn change_lines(rx: broadcast::Receiver<Change>) -> BoxStream<'static, String> {
    stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(change) => Some((render_change(change), rx)),
            Err(RecvError::Lagged(missed)) => Some((render_lagged(missed), rx)),
            Err(RecvError::Closed) => None,
        }
    })
    .boxed()
}

fn start_watch(engine: &Engine, resource_id: Option<Ulid>, watches: &mut Watches) -> String {
    let result = if watches.len() >= MAX_WATCHES_PER_CONNECTION {
        Err(EngineError::LimitExceeded("too many watches on connection"))
    } else {
        engine.watch(resource_id).map(|rx| {
            watches.push(change_lines(rx));
            json!({ "watching": resource_id })
        })
    };
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(observability::QUERIES_TOTAL, "op" => "watch", "status" => status).increment(1);
    debug!(resource_id = ?resource_id, status, "watch");
    render(result)
}

/// Execute and render one parsed request, recording request metrics.
async fn handle_request(engine: &Engine, parsed: Result<Request, EngineError>) -> String {
    let started = Instant::now();
    let req = match parsed {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(observability::QUERIES_TOTAL, "op" => "invalid", "status" => "validation")
                .increment(1);
            debug!("rejected request: {e}");
            return render(Err(e));
        }
    };

    let op = op_label(&req);
    let result = execute(engine, req).await;
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.kind().as_str(),
    };
    metrics::counter!(observability::QUERIES_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(observability::QUERY_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());

    match &result {
        Err(e) if e.kind() == ErrorKind::Internal => error!(op, "request failed: {e}"),
        Err(e) => debug!(op, status, "{e}"),
        Ok(_) => debug!(op, "ok"),
    }
    render(result)
}
