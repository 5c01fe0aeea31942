use std::io::Write;

use anyhow::{bail, Error};

pub fn read_string_from_tty(query: &str, default: Option<&str>) -> Result<String, Error> {
    use std::io::{BufRead, BufReader};

    if let Some(default) = default {
        print!("{query} ([{default}]): ");
    } else {
        print!("{query}: ");
    }

    let _ = std::io::stdout().flush();
    let mut line = String::new();

    if BufReader::new(std::io::stdin()).read_line(&mut line)? == 0 {
        bail!("end of input while waiting for a response");
    }
    let line = line.trim();
    if line.is_empty() {
        if let Some(default) = default {
            Ok(default.to_string())
        } else {
            // Repeat query
            read_string_from_tty(query, default)
        }
    } else {
        Ok(line.trim().to_string())
    }
}

pub fn read_bool_from_tty(query: &str, default: Option<bool>) -> Result<bool, Error> {
    let default = default.map(|v| if v { "yes" } else { "no" });

    loop {
        let line = read_string_from_tty(query, default)?;
        match parse_boolean(&line.to_lowercase()) {
            Ok(val) => {
                return Ok(val);
            }
            Err(err) => {
                eprintln!("Failed to parse response - '{err}'");
            }
        }
    }
}

fn parse_boolean(value: &str) -> Result<bool, Error> {
    match value {
        "y" | "yes" | "true" | "1" | "on" => Ok(true),
        "n" | "no" | "false" | "0" | "off" => Ok(false),
        other => bail!("not a boolean: '{other}'"),
    }
}
