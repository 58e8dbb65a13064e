/// Scans a dumped UI-tree document for an element that is actually ready to
/// be interacted with: resource identifier equal to the target, clickable,
/// enabled, and laid out on screen (a `bounds` attribute is present).
///
/// The dump format is the uiautomator-style XML tree. Parsing walks the raw
/// bytes with a cursor instead of building a DOM; dumps are scanned once and
/// thrown away, and a malformed dump simply reads as "no match".
pub fn contains_matching_element(xml: &str, target_identifier: &str) -> bool {
    let bytes = xml.as_bytes();
    let mut index: usize = 0;

    while index < bytes.len() {
        if bytes[index] != b'<' {
            index += 1;
            continue;
        }
        if index + 1 >= bytes.len() {
            return false;
        }
        match bytes[index + 1] {
            // Closing tag: skip to '>'.
            b'/' => {
                index += 2;
                while index < bytes.len() && bytes[index] != b'>' {
                    index += 1;
                }
            }
            // Comment or declaration: skip to '>'.
            b'!' | b'?' => {
                index += 2;
                while index < bytes.len() && bytes[index] != b'>' {
                    index += 1;
                }
            }
            _ => {
                let (attrs_checked, next) = scan_element(xml, bytes, index + 1, target_identifier);
                if attrs_checked {
                    return true;
                }
                index = next;
                continue;
            }
        }
        index += 1;
    }
    false
}

/// Parses one element's attributes starting right after '<'. Returns whether
/// the element matches, and the cursor position to resume scanning from.
fn scan_element(
    xml: &str,
    bytes: &[u8],
    start: usize,
    target_identifier: &str,
) -> (bool, usize) {
    let mut cursor = start;
    while cursor < bytes.len() {
        let ch = bytes[cursor];
        if ch == b'/' || ch == b'>' || ch.is_ascii_whitespace() {
            break;
        }
        cursor += 1;
    }

    let mut id_matches = false;
    let mut clickable = false;
    let mut enabled = false;
    let mut has_bounds = false;

    while cursor < bytes.len() {
        while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            break;
        }
        let ch = bytes[cursor];
        if ch == b'>' {
            cursor += 1;
            break;
        }
        if ch == b'/' {
            cursor += 1;
            continue;
        }

        let name_start = cursor;
        while cursor < bytes.len()
            && bytes[cursor] != b'='
            && bytes[cursor] != b'>'
            && !bytes[cursor].is_ascii_whitespace()
        {
            cursor += 1;
        }
        if cursor >= bytes.len() || bytes[cursor] != b'=' {
            // Value-less attribute; keep scanning.
            continue;
        }
        let name = &xml[name_start..cursor];
        cursor += 1;
        if cursor >= bytes.len() {
            break;
        }
        let quote = bytes[cursor];
        if quote != b'"' && quote != b'\'' {
            // Malformed value; give up on this element.
            break;
        }
        cursor += 1;
        let value_start = cursor;
        while cursor < bytes.len() && bytes[cursor] != quote {
            cursor += 1;
        }
        if cursor >= bytes.len() {
            break;
        }
        let value = &xml[value_start..cursor];
        cursor += 1;

        match name {
            "resource-id" => id_matches = value == target_identifier,
            "clickable" => clickable = value == "true",
            "enabled" => enabled = value == "true",
            "bounds" => has_bounds = !value.is_empty(),
            _ => {}
        }
    }

    (id_matches && clickable && enabled && has_bounds, cursor)
}
