use std::collections::BTreeMap;
use std::fmt::Write;

use crate::ObjectRef;

/// How many of the most recently added references are listed individually.
const LAST_ENTRIES: usize = 10;

/// Formats a human-readable listing of the references held by a table.
///
/// The `entries` are pairs of slot index and reference, in slot order, with holes left out.
/// The output lists the last few entries by slot index, followed by every distinct reference
/// with the number of slots holding it, most frequent first. The output only depends on the
/// contents of `entries`.
pub(crate) fn format_dump(entries: &[(usize, ObjectRef)]) -> String {
    let mut out = String::from("local reference table dump:\n");

    if entries.is_empty() {
        out.push_str("  (empty)\n");
        return out;
    }

    let last_start = entries.len().saturating_sub(LAST_ENTRIES);
    let last = entries.get(last_start..).unwrap_or_default();

    // Writing to a String cannot fail.
    _ = writeln!(out, "  Last {} entries (of {}):", last.len(), entries.len());

    for (index, obj) in last {
        _ = writeln!(out, "    {index:>5}: {obj}");
    }

    let mut counts = BTreeMap::<ObjectRef, usize>::new();
    for (_, obj) in entries {
        *counts.entry(*obj).or_default() += 1;
    }

    let mut summary = counts.into_iter().collect::<Vec<_>>();

    // Stable sort keeps the address order of the map among equal counts.
    summary.sort_by(|(_, a), (_, b)| b.cmp(a));

    _ = writeln!(out, "  Summary ({} distinct):", summary.len());

    for (obj, count) in summary {
        _ = writeln!(out, "    {count:>5} of {obj}");
    }

    out
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn obj(addr: u64) -> ObjectRef {
        ObjectRef::new(addr).unwrap()
    }

    /// Entries in consecutive slots, starting at slot 0.
    fn packed(objs: impl IntoIterator<Item = ObjectRef>) -> Vec<(usize, ObjectRef)> {
        objs.into_iter().enumerate().collect()
    }

    #[test]
    fn empty_dump() {
        assert_eq!(
            format_dump(&[]),
            "local reference table dump:\n  (empty)\n"
        );
    }

    #[test]
    fn summary_is_sorted_by_count() {
        let entries = packed([obj(0x10), obj(0x20), obj(0x20), obj(0x30), obj(0x20), obj(0x10)]);

        let dump = format_dump(&entries);

        assert!(dump.contains("Last 6 entries (of 6):"));
        assert!(dump.contains("Summary (3 distinct):"));

        let summary = dump.split("Summary").nth(1).unwrap();
        let lines = summary.lines().skip(1).map(str::trim).collect::<Vec<_>>();

        assert_eq!(lines, ["3 of 0x20", "2 of 0x10", "1 of 0x30"]);
    }

    #[test]
    fn only_last_entries_are_listed() {
        let entries = packed((1..=25).map(|i| obj(i * 8)));

        let dump = format_dump(&entries);

        assert!(dump.contains("Last 10 entries (of 25):"));
        assert!(dump.contains("   24: 0xc8"));
        assert!(dump.contains("   15: 0x80"));
        assert!(!dump.contains("   14: "));
    }

    #[test]
    fn dump_is_deterministic() {
        let entries = packed([obj(0x48), obj(0x18), obj(0x48), obj(0x18)]);

        assert_eq!(format_dump(&entries), format_dump(&entries));

        // Equal counts are listed in address order.
        let dump = format_dump(&entries);
        let first = dump.find("2 of 0x18").unwrap();
        let second = dump.find("2 of 0x48").unwrap();
        assert!(first < second);
    }

    #[test]
    fn entries_are_listed_by_slot_index() {
        // Slots 1 and 2 are holes, slots 4 to 7 hold one checked reference at slot 6.
        let entries = [(0, obj(0x10)), (3, obj(0x20)), (6, obj(0x30))];

        let dump = format_dump(&entries);

        assert!(dump.contains("Last 3 entries (of 3):"));
        assert!(dump.contains("        0: 0x10"));
        assert!(dump.contains("        3: 0x20"));
        assert!(dump.contains("        6: 0x30"));
        assert!(!dump.contains("        1: "));
        assert!(!dump.contains("        2: "));
    }
}
