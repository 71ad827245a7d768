use std::collections::BTreeMap;

use crate::error::BuildError;

/// A pinned `name==version` dependency.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Requirement {
    pub name: String,
    pub version: String,
    /// Optional features, as in `uvicorn[standard]`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extras: Vec<String>,
    /// Present when no prebuilt artifact exists and the package must be compiled.
    /// Holds extra system packages needed for the build (may be empty).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub native: Option<Vec<String>>,
}

impl Requirement {
    pub fn pinned(name: &str, version: &str) -> Self {
        Self {
            name: normalize_name(name),
            version: version.to_string(),
            extras: Vec::new(),
            native: None,
        }
    }

    pub fn native(name: &str, version: &str, system_packages: &[&str]) -> Self {
        Self {
            native: Some(system_packages.iter().map(|s| s.to_string()).collect()),
            ..Self::pinned(name, version)
        }
    }

    pub fn is_native(&self) -> bool {
        self.native.is_some()
    }

    /// The installer argument, e.g. `pandas==2.2.2` or `uvicorn[standard]==0.30.1`.
    pub fn pin(&self) -> String {
        if self.extras.is_empty() {
            format!("{}=={}", self.name, self.version)
        } else {
            format!("{}[{}]=={}", self.name, self.extras.join(","), self.version)
        }
    }
}

pub fn normalize_name(name: &str) -> String {
    name.trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c == '_' || c == '.' { '-' } else { c })
        .collect()
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn valid_version(version: &str) -> bool {
    !version.is_empty()
        && !version.contains('*')
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+' | '!'))
}

fn parse_marker(raw: &str, line: usize) -> Result<Vec<String>, BuildError> {
    let inner = raw
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .ok_or_else(|| BuildError::InvalidRequirement {
            line,
            reason: format!("malformed marker: {raw}"),
        })?
        .trim();

    let (key, rest) = match inner.split_once(':') {
        Some((k, r)) => (k.trim(), Some(r)),
        None => (inner, None),
    };
    if key != "native" {
        return Err(BuildError::InvalidRequirement {
            line,
            reason: format!("unknown marker: {key}"),
        });
    }

    let mut packages = Vec::new();
    for p in rest.unwrap_or_default().split(',') {
        let p = p.trim();
        if p.is_empty() {
            continue;
        }
        if !valid_name(p) {
            return Err(BuildError::InvalidRequirement {
                line,
                reason: format!("invalid system package name: {p}"),
            });
        }
        if !packages.iter().any(|x| x == p) {
            packages.push(p.to_string());
        }
    }
    Ok(packages)
}

/// Splits `name[extra,...]` into its parts.
fn parse_name(raw: &str, line: usize) -> Result<(String, Vec<String>), BuildError> {
    let (name, extras) = match raw.split_once('[') {
        Some((name, rest)) => {
            let inner = rest
                .strip_suffix(']')
                .ok_or_else(|| BuildError::InvalidRequirement {
                    line,
                    reason: format!("malformed extras: {raw}"),
                })?;
            (name.trim(), Some(inner))
        }
        None => (raw, None),
    };
    if !valid_name(name) {
        return Err(BuildError::InvalidRequirement {
            line,
            reason: format!("invalid package name: {name}"),
        });
    }

    let mut out: Vec<String> = Vec::new();
    for e in extras.unwrap_or_default().split(',') {
        let e = e.trim();
        if e.is_empty() {
            continue;
        }
        if !valid_name(e) {
            return Err(BuildError::InvalidRequirement {
                line,
                reason: format!("invalid extra: {e}"),
            });
        }
        let e = normalize_name(e);
        if !out.contains(&e) {
            out.push(e);
        }
    }
    Ok((normalize_name(name), out))
}

fn parse_line(raw: &str, line: usize) -> Result<Option<Requirement>, BuildError> {
    let text = match raw.split_once('#') {
        Some((before, _)) => before,
        None => raw,
    }
    .trim();
    if text.is_empty() {
        return Ok(None);
    }

    // Extras sit before `==`, the build marker after the version.
    let Some((name, rest)) = text.split_once("==") else {
        return Err(BuildError::InvalidRequirement {
            line,
            reason: format!("requirement must be pinned with '==': {text}"),
        });
    };
    let (version, marker) = match rest.find('[') {
        Some(i) => (rest[..i].trim(), Some(rest[i..].trim())),
        None => (rest.trim(), None),
    };

    let (name, extras) = parse_name(name.trim(), line)?;
    if !valid_version(version) {
        return Err(BuildError::InvalidRequirement {
            line,
            reason: format!("version must be an exact pin: {version}"),
        });
    }

    let native = marker.map(|m| parse_marker(m, line)).transpose()?;

    Ok(Some(Requirement {
        name,
        version: version.to_string(),
        extras,
        native,
    }))
}

/// Parses a requirements file. Line numbers in errors are 1-based.
pub fn parse_requirements(text: &str) -> Result<Vec<Requirement>, BuildError> {
    let mut out: Vec<Requirement> = Vec::new();
    // name -> (first line, index in `out`)
    let mut seen: BTreeMap<String, (usize, usize)> = BTreeMap::new();

    for (i, raw) in text.lines().enumerate() {
        let line = i + 1;
        let Some(req) = parse_line(raw, line)? else {
            continue;
        };

        if let Some(&(first_line, idx)) = seen.get(&req.name) {
            let first = &mut out[idx];
            if first.version != req.version {
                return Err(BuildError::InvalidRequirement {
                    line,
                    reason: format!(
                        "{} pinned to {} here but to {} on line {}",
                        req.name, req.version, first.version, first_line
                    ),
                });
            }
            for e in req.extras {
                if !first.extras.contains(&e) {
                    first.extras.push(e);
                }
            }
            continue;
        }

        seen.insert(req.name.clone(), (line, out.len()));
        out.push(req);
    }

    Ok(out)
}
