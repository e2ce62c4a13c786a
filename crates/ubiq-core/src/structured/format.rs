//! Input/output formatting for structured encryption: passthrough,
//! prefix and suffix rules, radix conversion between the input and
//! output alphabets, and the key-number embedding in the leading output
//! character.

use num_bigint::BigInt;

use crate::error::{Error, Result};
use crate::structured::dataset::PassthroughRule;
use crate::structured::ffx;

/// A rule resolved for one call, carrying whatever it detached from the
/// input so [`fmt_output`] can reattach it.
#[derive(Debug, Clone)]
pub(crate) enum FormatRule {
    Passthrough {
        priority: i64,
        characters: String,
    },
    Prefix {
        priority: i64,
        length: usize,
        buffer: Vec<char>,
    },
    Suffix {
        priority: i64,
        length: usize,
        buffer: Vec<char>,
    },
}

impl FormatRule {
    fn priority(&self) -> i64 {
        match self {
            FormatRule::Passthrough { priority, .. }
            | FormatRule::Prefix { priority, .. }
            | FormatRule::Suffix { priority, .. } => *priority,
        }
    }
}

fn resolve_rules(legacy_passthrough: &str, rules: &[PassthroughRule]) -> Result<Vec<FormatRule>> {
    let mut resolved = Vec::with_capacity(rules.len() + 1);

    // no explicit passthrough rule: synthesize one from the legacy
    // passthrough string at priority 1
    if !rules.iter().any(|r| r.kind == "passthrough") {
        resolved.push(FormatRule::Passthrough {
            priority: 1,
            characters: legacy_passthrough.to_string(),
        });
    }

    for rule in rules {
        let resolved_rule = match rule.kind.as_str() {
            "passthrough" => FormatRule::Passthrough {
                priority: rule.priority,
                characters: rule.value.as_str().unwrap_or_default().to_string(),
            },
            "prefix" => FormatRule::Prefix {
                priority: rule.priority,
                length: rule.value.as_u64().unwrap_or(0) as usize,
                buffer: Vec::new(),
            },
            "suffix" => FormatRule::Suffix {
                priority: rule.priority,
                length: rule.value.as_u64().unwrap_or(0) as usize,
                buffer: Vec::new(),
            },
            other => {
                return Err(Error::UnsupportedAlgorithm(format!(
                    "passthrough rule type \"{other}\""
                )))
            }
        };
        resolved.push(resolved_rule);
    }
    Ok(resolved)
}

/// Split `input` into its format template and the trimmed text to be
/// ciphered.
///
/// Rules apply in ascending priority: passthrough characters are copied
/// into the template (non-passthrough positions get the placeholder
/// `placeholder_alphabet[0]`), prefix/suffix rules detach characters
/// into their buffers. The trimmed remainder must consist of
/// `valid_alphabet` characters only.
pub(crate) fn fmt_input(
    input: &str,
    legacy_passthrough: &str,
    valid_alphabet: &str,
    placeholder_alphabet: &str,
    rules: &[PassthroughRule],
) -> Result<(Vec<char>, Vec<char>, Vec<FormatRule>)> {
    let placeholder = placeholder_alphabet
        .chars()
        .next()
        .ok_or_else(|| Error::Crypto("empty output character set".into()))?;

    let mut rules = resolve_rules(legacy_passthrough, rules)?;
    rules.sort_by_key(FormatRule::priority);

    let mut fmt = Vec::with_capacity(input.chars().count());
    let mut trimmed: Vec<char> = input.chars().collect();

    for rule in &mut rules {
        match rule {
            FormatRule::Passthrough { characters, .. } => {
                let mut kept = Vec::with_capacity(trimmed.len());
                for c in std::mem::take(&mut trimmed) {
                    if characters.contains(c) {
                        fmt.push(c);
                    } else {
                        fmt.push(placeholder);
                        kept.push(c);
                    }
                }
                trimmed = kept;
            }
            FormatRule::Prefix { length, buffer, .. } => {
                let n = (*length).min(trimmed.len());
                buffer.extend(trimmed.drain(..n));
            }
            FormatRule::Suffix { length, buffer, .. } => {
                let n = (*length).min(trimmed.len());
                let at = trimmed.len() - n;
                buffer.extend(trimmed.drain(at..));
            }
        }
    }

    if trimmed.iter().any(|c| !valid_alphabet.contains(*c)) {
        return Err(Error::InvalidInputCharacter);
    }

    Ok((fmt, trimmed, rules))
}

/// Recompose the final string from the format template and the cipher
/// output, applying rules in descending priority.
pub(crate) fn fmt_output(fmt: &[char], s: &[char], rules: &[FormatRule]) -> Result<String> {
    let mut ordered: Vec<&FormatRule> = rules.iter().collect();
    ordered.sort_by_key(|r| std::cmp::Reverse(r.priority()));

    let mut s: Vec<char> = s.to_vec();
    for rule in ordered {
        match rule {
            FormatRule::Passthrough { characters, .. } => {
                let mut out = Vec::with_capacity(fmt.len());
                let mut rest = s.iter();
                for c in fmt {
                    if characters.contains(*c) {
                        out.push(*c);
                    } else {
                        out.push(*rest.next().ok_or_else(|| {
                            Error::Crypto("mismatched format and output strings".into())
                        })?);
                    }
                }
                if rest.next().is_some() {
                    return Err(Error::Crypto(
                        "mismatched format and output strings".into(),
                    ));
                }
                s = out;
            }
            FormatRule::Prefix { buffer, .. } => {
                let mut out = buffer.clone();
                out.extend(s);
                s = out;
            }
            FormatRule::Suffix { buffer, .. } => {
                s.extend(buffer.iter().copied());
            }
        }
    }
    Ok(s.into_iter().collect())
}

/// Re-express `s` (a number in the `src` alphabet) in the `dst`
/// alphabet, left-padded to the original length.
pub(crate) fn str_convert_radix(s: &[char], src: &[char], dst: &[char]) -> Result<Vec<char>> {
    let n: BigInt = ffx::string_to_number(src.len(), src, s)?;
    ffx::number_to_string(dst.len(), dst, &n, s.len())
}

/// Fold the key number into the leading output character:
/// `c0' = ocs[index(c0) + (key_number << shift)]`.
pub(crate) fn encode_key_number(
    s: &[char],
    ocs: &[char],
    key_number: i32,
    shift: u32,
) -> Result<Vec<char>> {
    let first = *s.first().ok_or(Error::InvalidInputCharacter)?;
    let index = ocs
        .iter()
        .position(|c| *c == first)
        .ok_or(Error::InvalidInputCharacter)?;
    let encoded = index + ((key_number as usize) << shift);
    let replacement = *ocs
        .get(encoded)
        .ok_or_else(|| Error::Crypto("key number out of range for alphabet".into()))?;

    let mut out = s.to_vec();
    out[0] = replacement;
    Ok(out)
}

/// Recover the key number and the original leading character.
pub(crate) fn decode_key_number(
    s: &[char],
    ocs: &[char],
    shift: u32,
) -> Result<(Vec<char>, i32)> {
    let first = *s.first().ok_or(Error::InvalidInputCharacter)?;
    let encoded = ocs
        .iter()
        .position(|c| *c == first)
        .ok_or(Error::InvalidInputCharacter)?;
    let key_number = encoded >> shift;
    let original = ocs[encoded - (key_number << shift)];

    let mut out = s.to_vec();
    out[0] = original;
    Ok((out, key_number as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chars(s: &str) -> Vec<char> {
        s.chars().collect()
    }

    fn rule(kind: &str, value: serde_json::Value, priority: i64) -> PassthroughRule {
        PassthroughRule {
            kind: kind.to_string(),
            value,
            priority,
        }
    }

    #[test]
    fn legacy_passthrough_is_synthesized() {
        let (fmt, trimmed, rules) =
            fmt_input("-12-34-", "-", "0123456789", "abcdef", &[]).unwrap();
        assert_eq!(fmt, chars("-aa-aa-"));
        assert_eq!(trimmed, chars("1234"));
        assert_eq!(rules.len(), 1);

        let out = fmt_output(&fmt, &chars("wxyz"), &rules).unwrap();
        assert_eq!(out, "-wx-yz-");
    }

    #[test]
    fn prefix_and_suffix_rules_detach_and_reattach() {
        let rules = [
            rule("passthrough", serde_json::json!("-"), 1),
            rule("prefix", serde_json::json!(2), 2),
            rule("suffix", serde_json::json!(1), 3),
        ];
        let (fmt, trimmed, resolved) =
            fmt_input("98-7654-1", "-", "0123456789", "abcdef", &rules).unwrap();
        // passthrough runs first, then 2 chars off the front, 1 off the back
        assert_eq!(trimmed, chars("7654"));

        let out = fmt_output(&fmt, &chars("0000"), &resolved).unwrap();
        assert_eq!(out, "98-0000-1");
    }

    #[test]
    fn invalid_character_is_rejected() {
        assert!(matches!(
            fmt_input("12$4", "-", "0123456789", "abcdef", &[]),
            Err(Error::InvalidInputCharacter)
        ));
    }

    #[test]
    fn unsupported_rule_type_is_rejected() {
        let rules = [rule("infix", serde_json::json!(1), 1)];
        assert!(matches!(
            fmt_input("1234", "", "0123456789", "abcdef", &rules),
            Err(Error::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn leftover_output_is_a_mismatch() {
        let (fmt, _, rules) = fmt_input("-12-", "-", "0123456789", "abcdef", &[]).unwrap();
        assert!(fmt_output(&fmt, &chars("123"), &rules).is_err());
    }

    #[test]
    fn radix_conversion_preserves_length() {
        let digits = chars("0123456789");
        let wide = chars("0123456789abcdefghijklmnopqrstuvwxyz");
        let converted = str_convert_radix(&chars("0042"), &digits, &wide).unwrap();
        assert_eq!(converted, chars("0016"));
        let back = str_convert_radix(&converted, &wide, &digits).unwrap();
        assert_eq!(back, chars("0042"));
    }

    #[test]
    fn key_number_round_trip() {
        let ocs = chars("0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ");
        let ct = chars("3xyz");
        for key_number in 0..8 {
            let encoded = encode_key_number(&ct, &ocs, key_number, 3).unwrap();
            assert_eq!(encoded[1..], ct[1..]);
            let (decoded, n) = decode_key_number(&encoded, &ocs, 3).unwrap();
            assert_eq!(n, key_number);
            assert_eq!(decoded, ct);
        }
    }

    #[test]
    fn key_number_zero_keeps_the_character() {
        let ocs = chars("0123456789");
        let encoded = encode_key_number(&chars("42"), &ocs, 0, 3).unwrap();
        assert_eq!(encoded, chars("42"));
    }
}
