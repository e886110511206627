// Text form for resources: "cpus:2;mem:1024;ports:[31000-32000]"
//
// A role is given in parentheses after the name: "cpus(analytics):4".
// Scalars are parsed as decimal fixed-point, never through a binary
// float.

use std::str::FromStr;

use crate::error::{ResourceError, Result};
use crate::resource::{Resource, Resources};
use crate::value::{Ranges, Scalar, TextSet, Value};
use crate::DEFAULT_ROLE;

impl FromStr for Resources {
    type Err = ResourceError;

    fn from_str(text: &str) -> Result<Self> {
        let mut bag = Resources::new();
        for part in text.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            bag.add(part.parse::<Resource>()?);
        }
        Ok(bag)
    }
}

impl FromStr for Resource {
    type Err = ResourceError;

    fn from_str(text: &str) -> Result<Self> {
        let (head, value_text) = text
            .split_once(':')
            .ok_or_else(|| ResourceError::Parse(format!("missing ':' in '{}'", text)))?;

        let (name, role) = match head.split_once('(') {
            Some((name, rest)) => {
                let role = rest
                    .strip_suffix(')')
                    .ok_or_else(|| ResourceError::Parse(format!("unclosed role in '{}'", head)))?;
                (name.trim(), role.trim())
            }
            None => (head.trim(), DEFAULT_ROLE),
        };
        if name.is_empty() {
            return Err(ResourceError::Parse(format!("empty resource name in '{}'", text)));
        }

        let value = parse_value(value_text.trim())?;
        let resource = Resource {
            name: name.to_string(),
            value,
            role: role.to_string(),
            reservation: None,
            persistence: None,
        };
        resource.validate()?;
        Ok(resource)
    }
}

fn parse_value(text: &str) -> Result<Value> {
    if let Some(inner) = text.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| ResourceError::Parse(format!("unclosed range in '{}'", text)))?;
        return parse_ranges(inner).map(Value::Ranges);
    }
    if let Some(inner) = text.strip_prefix('{') {
        let inner = inner
            .strip_suffix('}')
            .ok_or_else(|| ResourceError::Parse(format!("unclosed set in '{}'", text)))?;
        let items = inner
            .split(',')
            .map(|item| item.trim().to_string())
            .filter(|item| !item.is_empty());
        return Ok(Value::Set(TextSet::new(items)));
    }
    parse_scalar(text).map(Value::Scalar)
}

fn parse_ranges(inner: &str) -> Result<Ranges> {
    let mut intervals = Vec::new();
    for interval in inner.split(',') {
        let interval = interval.trim();
        if interval.is_empty() {
            continue;
        }
        let (begin, end) = interval
            .split_once('-')
            .ok_or_else(|| ResourceError::Parse(format!("malformed interval '{}'", interval)))?;
        let begin: u64 = begin
            .trim()
            .parse()
            .map_err(|_| ResourceError::Parse(format!("malformed interval '{}'", interval)))?;
        let end: u64 = end
            .trim()
            .parse()
            .map_err(|_| ResourceError::Parse(format!("malformed interval '{}'", interval)))?;
        if begin > end {
            return Err(ResourceError::Parse(format!(
                "interval '{}' runs backwards",
                interval
            )));
        }
        intervals.push((begin, end));
    }
    Ok(Ranges::new(intervals))
}

/// Parse a decimal number into fixed-point thousandths.
fn parse_scalar(text: &str) -> Result<Scalar> {
    let error = || ResourceError::Parse(format!("malformed scalar '{}'", text));

    let (whole_text, frac_text) = match text.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (text, ""),
    };
    let whole: i64 = if whole_text.is_empty() {
        0
    } else {
        whole_text.parse().map_err(|_| error())?
    };
    if whole < 0 {
        return Err(error());
    }

    // At most three fractional digits carry through; the rest truncate.
    let mut frac = 0i64;
    let mut digits = 0;
    for c in frac_text.chars() {
        let digit = c.to_digit(10).ok_or_else(error)? as i64;
        if digits < 3 {
            frac = frac * 10 + digit;
            digits += 1;
        }
    }
    while digits < 3 {
        frac *= 10;
        digits += 1;
    }

    Ok(Scalar::from_millis(whole * 1000 + frac))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalars() {
        assert_eq!(parse_scalar("2").unwrap(), Scalar::from_units(2));
        assert_eq!(parse_scalar("0.5").unwrap(), Scalar::from_millis(500));
        assert_eq!(parse_scalar("1.001").unwrap(), Scalar::from_millis(1001));
        assert_eq!(parse_scalar("1.0019").unwrap(), Scalar::from_millis(1001));
        assert!(parse_scalar("abc").is_err());
        assert!(parse_scalar("-1").is_err());
    }

    #[test]
    fn test_parse_resources() {
        let bag: Resources = "cpus:2;mem:1024;ports:[31000-32000]".parse().unwrap();
        assert_eq!(bag.scalar_quantity("cpus"), Scalar::from_units(2));
        assert_eq!(bag.scalar_quantity("mem"), Scalar::from_units(1024));
        assert_eq!(bag.iter().count(), 3);
    }

    #[test]
    fn test_parse_role() {
        let bag: Resources = "cpus(analytics):4;cpus:1".parse().unwrap();
        assert_eq!(bag.by_role("analytics").scalar_quantity("cpus"), Scalar::from_units(4));
        assert_eq!(bag.unreserved().scalar_quantity("cpus"), Scalar::from_units(1));
    }

    #[test]
    fn test_parse_set() {
        let bag: Resources = "labels:{ssd,raid}".parse().unwrap();
        assert_eq!(bag.iter().count(), 1);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("cpus".parse::<Resources>().is_err());
        assert!("ports:[10-5]".parse::<Resources>().is_err());
        assert!("cpus(ops:1".parse::<Resources>().is_err());
    }
}
