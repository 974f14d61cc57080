use std::collections::HashMap;

use ulid::Ulid;

use crate::model::*;

use super::conflict::{any_overlap, fits};

/// Tables that seat `min_capacity` and are free for `target`, best fit first.
///
/// `active_windows` holds only non-cancelled occupancy per table; a table with
/// no entry is treated as empty. An empty result is a normal answer.
pub fn find_available<'a>(
    target: &Window,
    min_capacity: u32,
    tables: impl IntoIterator<Item = &'a Table>,
    active_windows: &HashMap<Ulid, Vec<Window>>,
) -> Vec<Table> {
    let mut free: Vec<Table> = tables
        .into_iter()
        .filter(|t| fits(t, min_capacity))
        .filter(|t| {
            active_windows
                .get(&t.id)
                .is_none_or(|windows| !any_overlap(target, windows))
        })
        .cloned()
        .collect();
    sort_best_fit(&mut free);
    free
}

/// Ascending capacity, ties by table number.
pub fn sort_best_fit(tables: &mut [Table]) {
    tables.sort_by(|a, b| a.capacity.cmp(&b.capacity).then(a.number.cmp(&b.number)));
}

#[cfg(test)]
mod tests {
    use super::*;

    const H: Ms = 3_600_000;
    const DAY: Ms = 1_749_945_600_000;

    fn table(number: u32, capacity: u32) -> Table {
        Table { id: Ulid::new(), number, capacity }
    }

    fn w(start: Ms, minutes: u32) -> Window {
        Window::new(start, minutes).unwrap()
    }

    fn numbers(tables: &[Table]) -> Vec<u32> {
        tables.iter().map(|t| t.number).collect()
    }

    #[test]
    fn filters_by_capacity_smallest_first() {
        // A: 2 seats, B: 4, C: 6; three guests get [B, C]
        let tables = vec![table(3, 6), table(1, 2), table(2, 4)];
        let found = find_available(&w(DAY + 19 * H, 120), 3, &tables, &HashMap::new());
        assert_eq!(numbers(&found), vec![2, 3]);
    }

    #[test]
    fn ties_broken_by_number() {
        let tables = vec![table(9, 4), table(2, 4), table(5, 2)];
        let found = find_available(&w(DAY, 60), 1, &tables, &HashMap::new());
        assert_eq!(numbers(&found), vec![5, 2, 9]);
    }

    #[test]
    fn busy_table_is_dropped() {
        let a = table(1, 4);
        let b = table(2, 4);
        let mut busy = HashMap::new();
        busy.insert(a.id, vec![w(DAY + 19 * H, 120)]);
        let tables = vec![a, b];
        let found = find_available(&w(DAY + 20 * H, 60), 2, &tables, &busy);
        assert_eq!(numbers(&found), vec![2]);
    }

    #[test]
    fn adjacent_booking_keeps_table() {
        let a = table(1, 4);
        let mut busy = HashMap::new();
        busy.insert(a.id, vec![w(DAY + 19 * H, 120)]);
        let tables = vec![a];
        let found = find_available(&w(DAY + 21 * H, 60), 2, &tables, &busy);
        assert_eq!(numbers(&found), vec![1]);
    }

    #[test]
    fn nothing_fits_is_empty_not_error() {
        let tables = vec![table(1, 2), table(2, 4)];
        let found = find_available(&w(DAY, 60), 12, &tables, &HashMap::new());
        assert!(found.is_empty());
    }

    #[test]
    fn smaller_party_sees_superset() {
        let tables = vec![table(1, 2), table(2, 4), table(3, 6), table(4, 8)];
        let mut busy = HashMap::new();
        busy.insert(tables[2].id, vec![w(DAY + 18 * H, 180)]);
        let target = w(DAY + 19 * H, 90);
        for g in 2..=8 {
            let larger = find_available(&target, g, &tables, &busy);
            let smaller = find_available(&target, g - 1, &tables, &busy);
            for t in &larger {
                assert!(smaller.contains(t), "table {} missing for {} guests", t.number, g - 1);
            }
        }
    }

    #[test]
    fn result_is_non_decreasing_by_capacity() {
        let tables: Vec<Table> = [6, 2, 8, 4, 2, 6, 10]
            .iter()
            .enumerate()
            .map(|(i, &cap)| table(i as u32 + 1, cap))
            .collect();
        let found = find_available(&w(DAY, 60), 1, &tables, &HashMap::new());
        assert_eq!(found.len(), tables.len());
        assert!(found.windows(2).all(|p| p[0].capacity <= p[1].capacity));
    }
}
