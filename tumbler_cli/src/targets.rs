//! Targets compiled into the `tumbler` binary.

use tumbler_core::{TargetRegistry, TrialContext, TrialError};

const PARSER_UNIT: &str = "demo::parser";
const CODEC_UNIT: &str = "demo::codec";

pub fn registry() -> TargetRegistry {
    let mut registry = TargetRegistry::new();
    registry
        .register(PARSER_UNIT, "parse_header", parse_header)
        .register(CODEC_UNIT, "varint_roundtrip", varint_roundtrip);
    registry
}

/// Panics on inputs starting with `BAD` or `CRAS`, one probe per matched byte.
fn parse_header(ctx: &mut TrialContext) -> Result<(), TrialError> {
    let data = ctx.data();
    ctx.probe(PARSER_UNIT, 0);
    match data {
        [b'B', rest @ ..] => {
            ctx.probe(PARSER_UNIT, 1);
            if let [b'A', rest @ ..] = rest {
                ctx.probe(PARSER_UNIT, 2);
                if let [b'D', ..] = rest {
                    panic!("BAD input detected by harness!");
                }
            }
        }
        [b'C', rest @ ..] => {
            ctx.probe(PARSER_UNIT, 10);
            if let [b'R', rest @ ..] = rest {
                ctx.probe(PARSER_UNIT, 11);
                if let [b'A', rest @ ..] = rest {
                    ctx.probe(PARSER_UNIT, 12);
                    if let [b'S', ..] = rest {
                        panic!("CRASH input detected by harness!");
                    }
                }
            }
        }
        _ => {}
    }
    Ok(())
}

/// Any value decoded from the input must survive an encode/decode cycle.
fn varint_roundtrip(ctx: &mut TrialContext) -> Result<(), TrialError> {
    let Some((value, used)) = decode_varint(ctx.data()) else {
        ctx.probe(CODEC_UNIT, 0);
        return Ok(());
    };
    ctx.probe(CODEC_UNIT, used as u32);
    let encoded = encode_varint(value);
    match decode_varint(&encoded) {
        Some((again, len)) if again == value && len == encoded.len() => Ok(()),
        other => Err(TrialError::Assertion(format!(
            "varint {value} re-decoded as {other:?}"
        ))),
    }
}

fn decode_varint(bytes: &[u8]) -> Option<(u32, usize)> {
    let mut value = 0u32;
    for (i, byte) in bytes.iter().take(5).enumerate() {
        let chunk = u32::from(byte & 0x7f);
        if i == 4 && chunk > 0x0f {
            return None;
        }
        value |= chunk << (7 * i);
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
    }
    None
}

fn encode_varint(mut value: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return out;
        }
        out.push(byte | 0x80);
    }
}
