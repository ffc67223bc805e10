use covfuzz_core::decoder::{ArgValue, ParamType};
use covfuzz_core::harness::{InProcessHarness, Probe, RaisedError};

const MAX_NESTING: usize = 16;

/// Registers the routines the binary can fuzz without any external code.
pub fn register_demo_targets(harness: &mut InProcessHarness) {
    harness.register(
        "demo.markup.Validator.validate",
        vec![ParamType::Text],
        |probe, args| validate_markup(probe, text_arg(args, 0)),
    );
    harness.register(
        "demo.markup.Validator.max_depth",
        vec![ParamType::Text],
        |probe, args| {
            let depth = nesting_depth(probe, text_arg(args, 0));
            let mut slots = [0u8; MAX_NESTING];
            // Deeper documents index past the end and panic.
            slots[depth] = 1;
            Ok(())
        },
    );
    // Never drivable: the decoder has no layout for integers.
    harness.register(
        "demo.calc.Calculator.add",
        vec![ParamType::from_name("int"), ParamType::from_name("int")],
        |probe, _| {
            probe.mark(1);
            Ok(())
        },
    );
}

fn text_arg(args: &[ArgValue], index: usize) -> &str {
    args.get(index).and_then(ArgValue::as_text).unwrap_or_default()
}

/// Checks that every `<name ...>` is closed by a matching `</name>`.
/// Self-closing tags (`<br/>`) and `<!...>` declarations need no partner.
fn validate_markup(probe: &mut Probe<'_>, text: &str) -> Result<(), RaisedError> {
    let mut open: Vec<&str> = Vec::new();
    let mut rest = text;
    probe.mark(1);

    while let Some(start) = rest.find('<') {
        let Some(len) = rest[start..].find('>') else {
            probe.mark(3);
            return Err(RaisedError::new(
                "UnterminatedTag",
                format!("'<' at offset {} is never closed", text.len() - rest.len() + start),
            ));
        };
        let body = &rest[start + 1..start + len];
        rest = &rest[start + len + 1..];

        if body.starts_with('!') || body.ends_with('/') {
            probe.mark(5);
            continue;
        }
        if let Some(name) = body.strip_prefix('/') {
            let name = tag_name(name);
            match open.pop() {
                Some(expected) if expected == name => probe.mark(7),
                Some(expected) => {
                    probe.mark(11);
                    return Err(RaisedError::new(
                        "MismatchedTag",
                        format!("expected </{expected}>, found </{name}>"),
                    ));
                }
                None => {
                    probe.mark(13);
                    return Err(RaisedError::new(
                        "UnexpectedClosingTag",
                        format!("</{name}> has no opening tag"),
                    ));
                }
            }
        } else {
            let name = tag_name(body);
            if name.is_empty() {
                probe.mark(17);
                return Err(RaisedError::new("EmptyTag", "tag has no name"));
            }
            probe.mark(19);
            open.push(name);
        }
    }

    if let Some(unclosed) = open.last() {
        probe.mark(23);
        return Err(RaisedError::new(
            "UnclosedTag",
            format!("<{unclosed}> is never closed"),
        ));
    }
    probe.mark(29);
    Ok(())
}

fn nesting_depth(probe: &mut Probe<'_>, text: &str) -> usize {
    let mut depth = 0usize;
    let mut max = 0usize;
    for c in text.chars() {
        match c {
            '<' => {
                probe.mark(2);
                depth += 1;
                max = max.max(depth);
            }
            '>' => {
                probe.mark(3);
                depth = depth.saturating_sub(1);
            }
            _ => {}
        }
    }
    max
}

fn tag_name(body: &str) -> &str {
    body.split(|c: char| c.is_whitespace() || c == '/')
        .next()
        .unwrap_or_default()
}
