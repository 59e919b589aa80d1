//! Handling of the magic `,,` syntax in file names.


/// Locates the first unescaped magic separator in the supplied file
/// name. Returns the byte offset of the first comma of the pair, or
/// `None` if every pair is escaped.
pub fn find_separator(name: &str) -> Option<usize> {
    let bytes = name.as_bytes();
    let mut from = 0;
    loop {
        let sep = find_pair(bytes, from)?;
        // an unescaped pair is one not immediately followed by a third comma
        if bytes.get(sep + 2) != Some(&b',') {
            return Some(sep);
        }
        // resume at the escaping comma so overlapping pairs stay visible
        from = sep + 2;
    }
}

fn find_pair(bytes: &[u8], from: usize) -> Option<usize> {
    let end = bytes.len().checked_sub(1)?;
    (from..end).find(|&i| bytes[i] == b',' && bytes[i + 1] == b',')
}

/// Unescapes escaped separators in the prefix of `name` of byte length
/// `prefix`, in place: every `,,,` whose last comma falls inside the
/// prefix collapses to `,,` by shifting the tail left.
pub fn unescape(name: &mut String, prefix: usize) {
    let mut sz = prefix.min(name.len());
    let mut i = 0;
    while i + 2 < sz {
        if name.as_bytes()[i..i + 3] == *b",,," {
            // drop the escaping comma; the tail shifts left
            name.remove(i);
            sz -= 1;
            i += 1;
        } else {
            i += 1;
        }
    }
}
