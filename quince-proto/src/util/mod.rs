pub use self::uint::ParseUintError;
pub(crate) use self::uint::{parse_u16, parse_u64, parse_usize};

mod uint;

/// Splits a control line into its whitespace separated arguments
pub(crate) fn split_args(line: &[u8]) -> impl Iterator<Item = &'_ [u8]> {
    line.split(|&b| b == b' ' || b == b'\t')
        .filter(|arg| !arg.is_empty())
}

/// Splits `bytes` on `\r\n`, the last line doesn't need a terminator
pub(crate) fn crlf_lines(bytes: &[u8]) -> impl Iterator<Item = &'_ [u8]> {
    let mut rest = Some(bytes);
    core::iter::from_fn(move || {
        let current = rest?;
        if let Some(i) = memchr::memmem::find(current, b"\r\n") {
            rest = Some(&current[i + 2..]);
            Some(&current[..i])
        } else {
            rest = None;
            Some(current)
        }
    })
}
