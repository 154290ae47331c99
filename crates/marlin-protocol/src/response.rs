//! Parsing for lines the printer sends back over serial.

/// One heater's reading: current and target temperature in degrees Celsius,
/// plus PWM duty cycle when the firmware reports it (`@:`/`B@:`).
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub struct HeaterTemp {
    pub current: f64,
    pub target: f64,
    pub power: Option<u8>,
}

/// A `M105`-style temperature report line, e.g.
/// `T:210.00 /210.00 B:60.00 /60.00 T0:210.00 /210.00 @:127 B@:80`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct TemperatureSnapshot {
    /// The active tool head (`T:`), for firmware that doesn't distinguish
    /// extruders.
    pub tool: Option<HeaterTemp>,
    /// Per-extruder readings (`T0:`, `T1:`, ...), indexed by tool number.
    pub extruders: Vec<(u8, HeaterTemp)>,
    /// The heated bed (`B:`), if the printer has one.
    pub bed: Option<HeaterTemp>,
}

/// One classified line from the printer.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseLine {
    /// Bare `ok`.
    Ok,
    /// `ok N<n>`, acknowledging through line `n`.
    OkThrough(u32),
    /// `resend: N<n>` / `Resend: <n>`, requesting retransmission from line `n`.
    Resend(u32),
    /// `busy: processing` (or any other `busy:` reason).
    Busy,
    /// `Error:<text>`.
    Error(String),
    /// A temperature telemetry line.
    Temperature(TemperatureSnapshot),
    /// `echo:<text>`, informational firmware chatter.
    Echo(String),
    /// Anything else; preserved verbatim so callers can log it.
    Unknown(String),
}

/// Classify one line of printer output.
pub fn parse_response_line(line: &str) -> ResponseLine {
    let trimmed = line.trim();

    if trimmed == "ok" {
        return ResponseLine::Ok;
    }
    if let Some(rest) = trimmed.strip_prefix("ok N").or_else(|| trimmed.strip_prefix("ok n")) {
        if let Ok(n) = rest.split_whitespace().next().unwrap_or("").parse() {
            return ResponseLine::OkThrough(n);
        }
    }
    if trimmed.len() >= 7 && trimmed[..7].eq_ignore_ascii_case("resend:") {
        let rest = trimmed[7..].trim();
        let digits = rest.strip_prefix(&['N', 'n'][..]).unwrap_or(rest);
        if let Ok(n) = digits.trim().parse() {
            return ResponseLine::Resend(n);
        }
    }
    if let Some(rest) = trimmed.strip_prefix("Error:") {
        return ResponseLine::Error(rest.trim().to_owned());
    }
    if trimmed.starts_with("busy:") {
        return ResponseLine::Busy;
    }
    if let Some(snapshot) = parse_temperature_line(trimmed) {
        return ResponseLine::Temperature(snapshot);
    }
    if let Some(rest) = trimmed.strip_prefix("echo:") {
        return ResponseLine::Echo(rest.trim().to_owned());
    }

    ResponseLine::Unknown(trimmed.to_owned())
}

/// Parse a temperature telemetry line. Returns `None` for lines that carry
/// no `T:`/`T<n>:` reading at all, so callers can fall through to other
/// classifications.
fn parse_temperature_line(line: &str) -> Option<TemperatureSnapshot> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    let has_reading = tokens
        .iter()
        .any(|t| *t == "T" || t.starts_with("T:") || is_indexed_tool_token(t));
    if !has_reading {
        return None;
    }

    let mut snapshot = TemperatureSnapshot::default();
    let mut i = 0;
    while i < tokens.len() {
        let tok = tokens[i];

        if let Some(rest) = tok.strip_prefix("B@:") {
            if let Some(h) = snapshot.bed.as_mut() {
                h.power = rest.parse().ok();
            }
            i += 1;
            continue;
        }
        if let Some(rest) = tok.strip_prefix("@:") {
            if let Some(h) = snapshot.tool.as_mut() {
                h.power = rest.parse().ok();
            } else if let Some((_, h)) = snapshot.extruders.last_mut() {
                h.power = rest.parse().ok();
            }
            i += 1;
            continue;
        }
        if let Some(rest) = tok.strip_prefix("B:") {
            let Ok(current) = rest.parse::<f64>() else {
                i += 1;
                continue;
            };
            let (target, consumed) = read_target(&tokens, i);
            snapshot.bed = Some(HeaterTemp { current, target, power: None });
            i += consumed;
            continue;
        }
        if let Some(rest) = tok.strip_prefix("T:") {
            let Ok(current) = rest.parse::<f64>() else {
                i += 1;
                continue;
            };
            let (target, consumed) = read_target(&tokens, i);
            snapshot.tool = Some(HeaterTemp { current, target, power: None });
            i += consumed;
            continue;
        }
        if is_indexed_tool_token(tok) {
            let colon = tok.find(':').expect("is_indexed_tool_token checked for ':'");
            let idx: u8 = tok[1..colon].parse().expect("is_indexed_tool_token checked digits");
            if let Ok(current) = tok[colon + 1..].parse::<f64>() {
                let (target, consumed) = read_target(&tokens, i);
                snapshot.extruders.push((idx, HeaterTemp { current, target, power: None }));
                i += consumed;
                continue;
            }
        }

        i += 1;
    }

    Some(snapshot)
}

/// `Tn:`/`T:`/`B:` tokens are optionally followed by a bare `/<target>`
/// token. Returns the target (or `0.0` if absent) and how many tokens to
/// advance past (1 or 2).
fn read_target(tokens: &[&str], current_index: usize) -> (f64, usize) {
    match tokens.get(current_index + 1).and_then(|t| t.strip_prefix('/')) {
        Some(target_str) => (target_str.parse().unwrap_or(0.0), 2),
        None => (0.0, 1),
    }
}

fn is_indexed_tool_token(tok: &str) -> bool {
    let Some(rest) = tok.strip_prefix('T') else { return false };
    match rest.find(':') {
        Some(colon) => !rest[..colon].is_empty() && rest[..colon].bytes().all(|b| b.is_ascii_digit()),
        None => false,
    }
}
