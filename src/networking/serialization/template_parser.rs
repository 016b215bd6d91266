//! Parser for the `message_template.msg` text format
//!
//! ```text
//! {
//!     TestMessage Low 1 NotTrusted Zerocoded
//!     {
//!         TestBlock1 Single
//!         {   Test1   U32 }
//!     }
//! }
//! ```

use crate::networking::packets::{BlockTemplate, Frequency, MessageTemplate, Quantity, VariableTemplate};

#[derive(Debug, PartialEq)]
enum ParseState {
    TopLevel,
    InMessage,
    InBlock,
}

fn parse_frequency(s: &str) -> Result<Frequency, String> {
    match s {
        "High" => Ok(Frequency::High),
        "Medium" => Ok(Frequency::Medium),
        "Low" => Ok(Frequency::Low),
        "Fixed" => Ok(Frequency::Fixed),
        _ => Err(format!("Unknown frequency: {}", s)),
    }
}

fn parse_trust(s: &str) -> Result<bool, String> {
    match s {
        "Trusted" => Ok(true),
        "NotTrusted" => Ok(false),
        _ => Err(format!("Unknown trust level: {}", s)),
    }
}

fn parse_encoding(s: &str) -> Result<bool, String> {
    match s {
        "Zerocoded" => Ok(true),
        "Unencoded" => Ok(false),
        _ => Err(format!("Unknown encoding: {}", s)),
    }
}

fn parse_number(s: &str) -> Result<u32, std::num::ParseIntError> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        s.parse::<u32>()
    }
}

/// Parses the content of a message_template.msg file.
///
/// Trailing header flags (`UDPDeprecated`, `UDPBlackListed`, ...) are accepted and ignored.
pub fn parse(content: &str) -> Result<Vec<MessageTemplate>, String> {
    let mut messages = Vec::new();
    let mut state = ParseState::TopLevel;
    let mut current_message: Option<MessageTemplate> = None;
    let mut current_block: Option<BlockTemplate> = None;
    let mut brace_depth = 0usize;

    for (index, raw_line) in content.lines().enumerate() {
        let line_num = index + 1;
        let line = raw_line.trim();

        if line.is_empty() || line.starts_with("//") || line.starts_with("version") {
            continue;
        }

        match state {
            ParseState::TopLevel => {
                if line == "{" {
                    brace_depth += 1;
                    state = ParseState::InMessage;
                } else {
                    return Err(format!("Unexpected content at line {}: {}", line_num, line));
                }
            }

            ParseState::InMessage => {
                if line == "{" {
                    if current_message.is_none() {
                        return Err(format!("Block before message header at line {}", line_num));
                    }
                    brace_depth += 1;
                    state = ParseState::InBlock;
                } else if line == "}" {
                    brace_depth -= 1;
                    if let Some(message) = current_message.take() {
                        messages.push(message);
                    }
                    state = ParseState::TopLevel;
                } else {
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    if parts.len() < 5 {
                        return Err(format!(
                            "Invalid message header at line {}: expected at least 5 parts, got {}",
                            line_num,
                            parts.len()
                        ));
                    }

                    let frequency = parse_frequency(parts[1])
                        .map_err(|e| format!("Error parsing frequency at line {}: {}", line_num, e))?;
                    let number = parse_number(parts[2])
                        .map_err(|e| format!("Error parsing message number at line {}: {}", line_num, e))?;
                    let trusted = parse_trust(parts[3])
                        .map_err(|e| format!("Error parsing trust level at line {}: {}", line_num, e))?;
                    let zero_coded = parse_encoding(parts[4])
                        .map_err(|e| format!("Error parsing encoding at line {}: {}", line_num, e))?;

                    current_message = Some(
                        MessageTemplate::new(parts[0], frequency, number)
                            .trusted(trusted)
                            .zero_coded(zero_coded),
                    );
                }
            }

            ParseState::InBlock => {
                if line == "}" {
                    brace_depth -= 1;
                    if let (Some(message), Some(block)) = (current_message.as_mut(), current_block.take()) {
                        message.blocks.push(block);
                    }
                    state = ParseState::InMessage;
                } else if line.starts_with('{') && line.ends_with('}') {
                    // Variable line like "{ Test1 U32 }" or "{ Data Variable 2 }"
                    let content = line.trim_start_matches('{').trim_end_matches('}').trim();
                    let (name, kind) = content
                        .split_once(char::is_whitespace)
                        .ok_or_else(|| format!("Invalid variable at line {}: {}", line_num, line))?;
                    let kind = kind
                        .trim()
                        .parse()
                        .map_err(|e| format!("Error parsing variable type at line {}: {}", line_num, e))?;

                    let block = current_block
                        .as_mut()
                        .ok_or_else(|| format!("Variable outside block at line {}", line_num))?;
                    block.variables.push(VariableTemplate::new(name, kind));
                } else {
                    // Block header like "TestBlock1 Single" or "NeighborBlock Multiple 4"
                    let parts: Vec<&str> = line.split_whitespace().collect();
                    if parts.len() < 2 {
                        return Err(format!(
                            "Invalid block header at line {}: expected at least 2 parts",
                            line_num
                        ));
                    }

                    let quantity = match parts[1] {
                        "Single" => Quantity::Single,
                        "Variable" => Quantity::Variable,
                        "Multiple" => {
                            let count = parts
                                .get(2)
                                .ok_or_else(|| format!("Missing block count at line {}", line_num))?
                                .parse::<usize>()
                                .map_err(|e| format!("Error parsing block count at line {}: {}", line_num, e))?;
                            Quantity::Multiple(count)
                        }
                        other => {
                            return Err(format!(
                                "Error parsing quantity at line {}: Unknown quantity: {}",
                                line_num, other
                            ))
                        }
                    };

                    current_block = Some(BlockTemplate::new(parts[0], quantity));
                }
            }
        }
    }

    if brace_depth != 0 {
        return Err(format!("Unmatched braces: depth {} at end of file", brace_depth));
    }

    Ok(messages)
}
