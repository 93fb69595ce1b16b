//! Text serialization of properties and map points.

use std::fmt::Write as _;

use crate::store::PropertySet;
use crate::urn::Urn;

/// Percent-escape bytes that would break the line-oriented formats.
pub(crate) fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' | '\n' | '\r' | '<' | '>' | ',' => {
                let _ = write!(out, "%{:02X}", c as u32);
            }
            c if c.is_control() => {
                let mut buf = [0u8; 4];
                for b in c.encode_utf8(&mut buf).bytes() {
                    let _ = write!(out, "%{:02X}", b);
                }
            }
            c => out.push(c),
        }
    }
    out
}

/// Serialize the persistent attributes of `subject`.
///
/// Lines for `owner` itself are written relative (`attribute=value`), every
/// other subject is written fully qualified (`<urn> attribute=value`).
pub fn write_properties(out: &mut String, owner: &Urn, subject: &Urn, set: &PropertySet) {
    write_lines(out, subject, set, subject != owner, &[]);
}

/// Serialize `subject` with every line fully qualified, leaving out the
/// attributes in `skip`.
pub fn write_qualified(out: &mut String, subject: &Urn, set: &PropertySet, skip: &[&str]) {
    write_lines(out, subject, set, true, skip);
}

fn write_lines(out: &mut String, subject: &Urn, set: &PropertySet, qualified: bool, skip: &[&str]) {
    let persistent = set.persistent();
    for (attr, values) in persistent.iter() {
        if skip.contains(&attr) {
            continue;
        }
        for value in values {
            if qualified {
                let _ = write!(out, "<{}> ", escape(subject.as_str()));
            }
            let _ = writeln!(out, "{}={}", attr, escape(&value.to_text()));
        }
    }
}

#[cfg(test)]
pub fn properties_to_string<'a, I>(owner: &Urn, subjects: I) -> String
where
    I: IntoIterator<Item = (&'a Urn, &'a PropertySet)>,
{
    let mut out = String::new();
    for (subject, set) in subjects {
        write_properties(&mut out, owner, subject, set);
    }
    out
}

/// One `image_offset,target_offset,target_urn` line per point.
pub fn write_map_line(out: &mut String, image_offset: u64, target_offset: u64, target: &Urn) {
    let _ = writeln!(
        out,
        "{},{},{}",
        image_offset,
        target_offset,
        escape(target.as_str())
    );
}
