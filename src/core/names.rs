//! Validation of object paths, bus names, interface names, member names and error names.

use crate::error::{BusError, Result};

/// Maximum length of any bus, interface, member or error name
pub const MAX_NAME_LEN: usize = 255;

fn invalid(kind: &str, name: &str, reason: &str) -> BusError {
    BusError::InvalidName(format!("{kind} '{name}': {reason}"))
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// `/` or `/elem(/elem)*` where each element is `[A-Za-z0-9_]+`
pub fn validate_object_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(invalid("object path", path, "must start with '/'"));
    }
    if path == "/" {
        return Ok(());
    }
    if path.ends_with('/') {
        return Err(invalid("object path", path, "trailing '/'"));
    }
    for element in path[1..].split('/') {
        if element.is_empty() {
            return Err(invalid("object path", path, "empty element"));
        }
        if !element.chars().all(is_name_char) {
            return Err(invalid("object path", path, "invalid character"));
        }
    }
    Ok(())
}

fn validate_dotted(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid(kind, name, "length must be 1..=255"));
    }
    let elements: Vec<&str> = name.split('.').collect();
    if elements.len() < 2 {
        return Err(invalid(kind, name, "needs at least two elements"));
    }
    for element in elements {
        let mut chars = element.chars();
        match chars.next() {
            None => return Err(invalid(kind, name, "empty element")),
            Some(c) if c.is_ascii_digit() => {
                return Err(invalid(kind, name, "element starts with a digit"))
            }
            Some(c) if !is_name_char(c) => {
                return Err(invalid(kind, name, "invalid character"))
            }
            Some(_) => {}
        }
        if !chars.all(is_name_char) {
            return Err(invalid(kind, name, "invalid character"));
        }
    }
    Ok(())
}

pub fn validate_interface_name(name: &str) -> Result<()> {
    validate_dotted("interface name", name)
}

/// Error names follow the interface name grammar
pub fn validate_error_name(name: &str) -> Result<()> {
    validate_dotted("error name", name)
}

pub fn validate_member_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid("member name", name, "length must be 1..=255"));
    }
    if name.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid("member name", name, "starts with a digit"));
    }
    if !name.chars().all(is_name_char) {
        return Err(invalid("member name", name, "invalid character"));
    }
    Ok(())
}

/// Unique (`:1.42`) or well-known (`org.example.Service`) bus name
pub fn validate_bus_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(invalid("bus name", name, "length must be 1..=255"));
    }
    let unique = name.starts_with(':');
    let body = if unique { &name[1..] } else { name };

    let elements: Vec<&str> = body.split('.').collect();
    if elements.len() < 2 {
        return Err(invalid("bus name", name, "needs at least two elements"));
    }
    for element in elements {
        if element.is_empty() {
            return Err(invalid("bus name", name, "empty element"));
        }
        if !unique && element.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(invalid("bus name", name, "element starts with a digit"));
        }
        if !element.chars().all(|c| is_name_char(c) || c == '-') {
            return Err(invalid("bus name", name, "invalid character"));
        }
    }
    Ok(())
}
