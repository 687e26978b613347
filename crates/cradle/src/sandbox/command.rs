//! Command-line splitting for unsafe commands.

use super::SandboxError;

/// Split `line` into words.
///
/// Words are separated by whitespace. Single quotes keep their contents
/// literally, double quotes allow `\"` and `\\` escapes, and a backslash
/// outside quotes escapes the next character.
pub fn split_command(line: &str) -> Result<Vec<String>, SandboxError> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => word.push(c),
                        None => return Err(unterminated('\'')),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c @ ('"' | '\\')) => word.push(c),
                            Some(c) => {
                                word.push('\\');
                                word.push(c);
                            }
                            None => return Err(unterminated('"')),
                        },
                        Some(c) => word.push(c),
                        None => return Err(unterminated('"')),
                    }
                }
            }
            '\\' => {
                in_word = true;
                if let Some(c) = chars.next() {
                    word.push(c);
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }
    if in_word {
        words.push(word);
    }

    if words.is_empty() {
        return Err(SandboxError::InvalidCommand("empty command".to_string()));
    }
    Ok(words)
}

fn unterminated(quote: char) -> SandboxError {
    SandboxError::InvalidCommand(format!("unterminated {quote} quote"))
}
