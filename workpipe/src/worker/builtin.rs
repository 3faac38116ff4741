//! Workers compiled into every shim.
//!
//! `json.*` workers edit the JSON payload; `bytes.*` workers exercise the
//! stage channel.

use super::WorkerRegistration;
use crate::pipeline::StageContext;
use anyhow::{Context, anyhow, bail};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

const CHUNK: usize = 64 * 1024;

/// Built-in workers, looked up before link-time registrations.
pub static BUILTIN_WORKERS: &[WorkerRegistration] = &[
    WorkerRegistration {
        name: "json.scale",
        run: json_scale,
    },
    WorkerRegistration {
        name: "json.set",
        run: json_set,
    },
    WorkerRegistration {
        name: "json.copy",
        run: json_copy,
    },
    WorkerRegistration {
        name: "json.fail",
        run: json_fail,
    },
    WorkerRegistration {
        name: "bytes.random",
        run: bytes_random,
    },
    WorkerRegistration {
        name: "bytes.collect",
        run: bytes_collect,
    },
];

fn str_arg<'a>(ctx: &'a StageContext, key: &str) -> anyhow::Result<&'a str> {
    ctx.args()
        .get(key)
        .and_then(Value::as_str)
        .with_context(|| format!("stage '{}' needs a string argument '{}'", ctx.stage_name(), key))
}

fn object_mut<'a>(payload: &'a mut Value) -> anyhow::Result<&'a mut Map<String, Value>> {
    payload
        .as_object_mut()
        .ok_or_else(|| anyhow!("payload is not a JSON object"))
}

/// `{field, factor}`: multiply a numeric field. Integers stay integers when
/// the factor is one too.
fn json_scale(payload: &mut Value, ctx: &mut StageContext) -> anyhow::Result<()> {
    let field = str_arg(ctx, "field")?;
    let factor = ctx
        .args()
        .get("factor")
        .filter(|f| f.is_number())
        .context("json.scale needs a numeric 'factor'")?;

    let object = object_mut(payload)?;
    let current = object
        .get(field)
        .with_context(|| format!("field '{}' is missing", field))?;

    let scaled = match (current.as_i64(), factor.as_i64()) {
        (Some(a), Some(b)) => Value::from(
            a.checked_mul(b)
                .with_context(|| format!("scaling '{}' overflowed", field))?,
        ),
        _ => {
            let a = current
                .as_f64()
                .with_context(|| format!("field '{}' is not a number", field))?;
            let b = factor.as_f64().unwrap_or(1.0);
            serde_json::Number::from_f64(a * b)
                .map(Value::Number)
                .with_context(|| format!("scaling '{}' produced a non-finite number", field))?
        }
    };
    object.insert(field.to_string(), scaled);
    Ok(())
}

/// `{field, value}`: set a field.
fn json_set(payload: &mut Value, ctx: &mut StageContext) -> anyhow::Result<()> {
    let field = str_arg(ctx, "field")?;
    let value = ctx.args().get("value").cloned().unwrap_or(Value::Null);
    object_mut(payload)?.insert(field.to_string(), value);
    Ok(())
}

/// `{from, to}`: copy one field onto another.
fn json_copy(payload: &mut Value, ctx: &mut StageContext) -> anyhow::Result<()> {
    let from = str_arg(ctx, "from")?;
    let to = str_arg(ctx, "to")?;
    let object = object_mut(payload)?;
    let value = object
        .get(from)
        .cloned()
        .with_context(|| format!("field '{}' is missing", from))?;
    object.insert(to.to_string(), value);
    Ok(())
}

/// `{message}`: always fails.
fn json_fail(_: &mut Value, ctx: &mut StageContext) -> anyhow::Result<()> {
    let message = ctx
        .args()
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("json.fail");
    bail!("{}", message)
}

/// `{len, seed?}`: stream `len` random bytes to the next stage.
fn bytes_random(_: &mut Value, ctx: &mut StageContext) -> anyhow::Result<()> {
    let len = ctx
        .args()
        .get("len")
        .and_then(Value::as_u64)
        .context("bytes.random needs an integer 'len'")?;
    let mut rng = match ctx.args().get("seed").and_then(Value::as_u64) {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    };

    let writer = ctx
        .writer()
        .context("bytes.random must pipe into the next stage")?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    let mut remaining = len;
    while remaining > 0 {
        let n = remaining.min(CHUNK as u64) as usize;
        rng.fill_bytes(&mut buf[..n]);
        hasher.update(&buf[..n]);
        writer.write(&buf[..n])?;
        remaining -= n as u64;
    }
    writer.write_eof(&[])?;
    let bytes_written = writer.bytes_written();

    ctx.set_output(json!({
        "bytes_written": bytes_written,
        "sha256": hex::encode(hasher.finalize()),
    }))?;
    Ok(())
}

/// `{}`: read the previous stage's stream to EOF.
fn bytes_collect(_: &mut Value, ctx: &mut StageContext) -> anyhow::Result<()> {
    let reader = ctx
        .reader()
        .context("bytes.collect must consume a piped stage")?;
    let mut hasher = Sha256::new();
    loop {
        let chunk = reader.read()?;
        if chunk.is_empty() {
            break;
        }
        hasher.update(&chunk);
    }
    let bytes_read = reader.bytes_read();

    ctx.set_output(json!({
        "bytes_read": bytes_read,
        "sha256": hex::encode(hasher.finalize()),
    }))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelEndpoint, create_reader_writer_pair};

    fn ctx(args: Value) -> StageContext {
        StageContext::new(0, "builtin", args)
    }

    #[test]
    fn test_scale_keeps_integers() {
        let mut payload = json!({"counter": 100});
        json_scale(&mut payload, &mut ctx(json!({"field": "counter", "factor": 2}))).unwrap();
        json_scale(&mut payload, &mut ctx(json!({"field": "counter", "factor": 2}))).unwrap();
        assert_eq!(payload["counter"], json!(400));
    }

    #[test]
    fn test_scale_float() {
        let mut payload = json!({"x": 3});
        json_scale(&mut payload, &mut ctx(json!({"field": "x", "factor": 0.5}))).unwrap();
        assert_eq!(payload["x"], json!(1.5));
    }

    #[test]
    fn test_scale_errors() {
        let mut payload = json!({"x": "text"});
        assert!(json_scale(&mut payload, &mut ctx(json!({"field": "x", "factor": 2}))).is_err());
        assert!(json_scale(&mut payload, &mut ctx(json!({"field": "y", "factor": 2}))).is_err());
        assert!(json_scale(&mut payload, &mut ctx(json!({"field": "x"}))).is_err());
        let mut not_object = json!([1]);
        assert!(json_scale(&mut not_object, &mut ctx(json!({"field": "x", "factor": 2}))).is_err());
    }

    #[test]
    fn test_set_and_copy() {
        let mut payload = json!({"parent": "X"});
        json_set(&mut payload, &mut ctx(json!({"field": "label", "value": "stage1"}))).unwrap();
        json_copy(&mut payload, &mut ctx(json!({"from": "parent", "to": "origin"}))).unwrap();
        assert_eq!(payload, json!({"parent": "X", "label": "stage1", "origin": "X"}));

        let err = json_copy(&mut payload, &mut ctx(json!({"from": "nope", "to": "x"}))).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn test_fail_uses_message() {
        let err = json_fail(&mut json!({}), &mut ctx(json!({"message": "boom"}))).unwrap_err();
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_random_into_collect() {
        let (reader, writer) = create_reader_writer_pair().unwrap();

        let producer = std::thread::spawn(move || {
            let mut ctx = ctx(json!({"len": 200_000, "seed": 42}))
                .with_endpoint(Some(ChannelEndpoint::Writer(writer)));
            bytes_random(&mut json!({}), &mut ctx).unwrap();
            ctx.output().cloned().unwrap()
        });

        let mut consumer = ctx(json!({})).with_endpoint(Some(ChannelEndpoint::Reader(reader)));
        bytes_collect(&mut json!({}), &mut consumer).unwrap();

        let produced = producer.join().unwrap();
        let consumed = consumer.output().unwrap();
        assert_eq!(produced["bytes_written"], json!(200_000));
        assert_eq!(consumed["bytes_read"], json!(200_000));
        assert_eq!(produced["sha256"], consumed["sha256"]);
    }

    #[test]
    fn test_random_seed_is_deterministic() {
        let run = || {
            let (mut reader, writer) = create_reader_writer_pair().unwrap();
            let mut ctx = ctx(json!({"len": 10, "seed": 1}))
                .with_endpoint(Some(ChannelEndpoint::Writer(writer)));
            bytes_random(&mut json!({}), &mut ctx).unwrap();
            reader.read_to_end().unwrap()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_bytes_workers_need_endpoints() {
        assert!(bytes_random(&mut json!({}), &mut ctx(json!({"len": 1}))).is_err());
        assert!(bytes_collect(&mut json!({}), &mut ctx(json!({}))).is_err());
    }
}
