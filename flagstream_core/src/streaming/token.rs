//! Deterministic obfuscation of the environment secret for the streaming
//! auth query. This is opacity over the wire, not cryptography; the layout
//! must be reproduced bit-for-bit:
//! `enc(k,3) || enc(|D|,2) || S[0..k] || enc(now,|D|) || S[k..]`
//! where `k` is a random split offset, `now` is epoch milliseconds and
//! `enc` maps decimal digits through a fixed alphabet.
use chrono::Utc;
use rand::Rng;

fn encode_digit(digit: u8) -> char {
    match digit {
        b'0' => 'Q',
        b'1' => 'B',
        b'2' => 'W',
        b'3' => 'S',
        b'4' => 'P',
        b'5' => 'H',
        b'6' => 'D',
        b'7' => 'X',
        b'8' => 'Z',
        b'9' => 'U',
        _ => unreachable!("decimal digits only"),
    }
}

/// Zero-pad `number` to `width` digits, then map each digit through the
/// alphabet.
fn encode_number(number: i64, width: usize) -> String {
    let padded = format!("{number:0width$}");
    padded.bytes().map(encode_digit).collect()
}

/// Build the `token` query value from the environment secret.
pub fn build_token(env_secret: &str) -> String {
    let text = env_secret.trim_end_matches('=');
    let now = Utc::now().timestamp_millis();

    let timestamp_code = encode_number(now, now.to_string().len());
    let start = if text.len() > 2 {
        rand::thread_rng().gen_range(2..=text.len())
    } else {
        text.len().min(2)
    };

    let mut token = String::with_capacity(text.len() + timestamp_code.len() + 5);
    token.push_str(&encode_number(start as i64, 3));
    token.push_str(&encode_number(timestamp_code.len() as i64, 2));
    token.push_str(&text[..start]);
    token.push_str(&timestamp_code);
    token.push_str(&text[start..]);
    token
}
