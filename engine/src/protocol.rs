//! Line-delimited JSON between the pool and a worker process.
//!
//! The pool writes one serialized [`WorkItem`] per line to the worker's
//! stdin and reads one [`Reply`] per line from its stdout. Closing stdin asks
//! the worker to exit once its current item is done.

use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::item::{ItemScores, WorkItem};

/// Per-item evaluation function hosted inside a worker process.
pub trait Scorer {
    fn score(&self, item: &WorkItem) -> Result<ItemScores>;
}

/// Worker answer for one item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Scored(ItemScores),
    Failed { message: String },
}

pub fn encode_request(item: &WorkItem) -> Result<String> {
    let mut line = serde_json::to_string(item).context("serialize work item")?;
    line.push('\n');
    Ok(line)
}

pub fn decode_reply(line: &str) -> Result<Reply> {
    serde_json::from_str(line.trim()).with_context(|| format!("parse reply {:?}", line.trim()))
}

/// Serve requests until `input` reaches EOF. Returns the number of items handled.
///
/// Scorer errors are reported back as `Reply::Failed`; only I/O and decoding
/// problems on the pipe itself end the loop with an error.
#[instrument(skip_all)]
pub fn serve<S: Scorer, R: BufRead, W: Write>(scorer: &S, input: R, mut output: W) -> Result<usize> {
    let mut handled = 0usize;
    for line in input.lines() {
        let line = line.context("read request")?;
        if line.trim().is_empty() {
            continue;
        }
        let item: WorkItem = serde_json::from_str(&line).context("parse request")?;
        let reply = match scorer.score(&item) {
            Ok(scores) => {
                debug!(item_id = %item.id, summary = scores.summary, "item scored");
                Reply::Scored(scores)
            }
            Err(err) => {
                warn!(item_id = %item.id, err = %format!("{err:#}"), "scoring failed");
                Reply::Failed {
                    message: format!("{err:#}"),
                }
            }
        };
        let mut payload = serde_json::to_string(&reply).context("serialize reply")?;
        payload.push('\n');
        output.write_all(payload.as_bytes()).context("write reply")?;
        output.flush().context("flush reply")?;
        handled += 1;
    }
    debug!(handled, "request stream closed");
    Ok(handled)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use anyhow::bail;
    use serde_json::{Value, json};

    use super::*;

    struct EchoScorer;

    impl Scorer for EchoScorer {
        fn score(&self, item: &WorkItem) -> Result<ItemScores> {
            if item.id.starts_with("bad") {
                bail!("cannot score {}", item.id);
            }
            let mut scores = ItemScores {
                summary: 1.0,
                ..ItemScores::default()
            };
            scores
                .metrics
                .entry("dice".to_string())
                .or_default()
                .insert("a".to_string(), 1.0);
            Ok(scores)
        }
    }

    #[test]
    fn serve_answers_each_line_in_order() {
        let mut input = String::new();
        input.push_str(&encode_request(&WorkItem::new("ok-1", Value::Null)).expect("encode"));
        input.push('\n');
        input.push_str(&encode_request(&WorkItem::new("bad-2", json!({"x": 1}))).expect("encode"));

        let mut output = Vec::new();
        let handled = serve(&EchoScorer, Cursor::new(input), &mut output).expect("serve");
        assert_eq!(handled, 2);

        let text = String::from_utf8(output).expect("utf8");
        let replies: Vec<Reply> = text.lines().map(|l| decode_reply(l).expect("decode")).collect();
        assert!(matches!(&replies[0], Reply::Scored(s) if s.summary == 1.0));
        assert_eq!(
            replies[1],
            Reply::Failed {
                message: "cannot score bad-2".to_string()
            }
        );
    }

    #[test]
    fn serve_rejects_garbage_requests() {
        let mut output = Vec::new();
        let err = serve(&EchoScorer, Cursor::new("not json\n"), &mut output).expect_err("garbage");
        assert!(err.to_string().contains("parse request"));
    }

    #[test]
    fn reply_wire_format_is_tagged() {
        let reply: Reply =
            decode_reply(r#"{"status":"scored","metrics":{"f":{"c":0.25}},"summary":0.25}"#)
                .expect("decode");
        let Reply::Scored(scores) = reply else {
            panic!("expected scored reply");
        };
        assert_eq!(scores.metrics["f"]["c"], 0.25);

        let failed = serde_json::to_value(Reply::Failed {
            message: "boom".to_string(),
        })
        .expect("serialize");
        assert_eq!(failed, json!({"status": "failed", "message": "boom"}));
    }
}
