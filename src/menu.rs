//! Menu selection model: the catalog plus the highlighted entry.
//!
//! Ordinals follow the on-screen numbering: `0` is the reserved "back" entry
//! and `1..=len` are catalog items.

use crate::catalog::{CarDefinition, Catalog};
use crate::constants::BACK_ORDINAL;

/// Currently highlighted menu entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Zero-based catalog index
    Item(usize),
    /// The reserved back entry
    Back,
}

/// Result of confirming the highlighted entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MenuChoice<'a> {
    Car(&'a CarDefinition),
    Back,
}

/// One line of the on-screen menu
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuEntry {
    pub ordinal: usize,
    pub label: String,
    pub description: String,
    pub highlighted: bool,
}

/// Pure selection logic over a read-only catalog
#[derive(Debug, Clone)]
pub struct MenuModel {
    catalog: Catalog,
    highlighted: Option<Selection>,
}

impl MenuModel {
    #[must_use]
    pub fn new(catalog: Catalog) -> Self {
        let mut menu = Self {
            catalog,
            highlighted: None,
        };
        menu.reset();
        menu
    }

    /// Highlight the first catalog item, or nothing when the catalog is empty
    pub fn reset(&mut self) {
        self.highlighted = if self.catalog.is_empty() {
            None
        } else {
            Some(Selection::Item(0))
        };
    }

    /// Highlight an on-screen ordinal; out-of-range ordinals are ignored.
    /// Returns whether the highlight changed.
    pub fn select(&mut self, ordinal: usize) -> bool {
        if self.catalog.is_empty() {
            return false;
        }
        let selection = if ordinal == BACK_ORDINAL {
            Selection::Back
        } else if ordinal <= self.catalog.len() {
            Selection::Item(ordinal - 1)
        } else {
            return false;
        };
        let changed = self.highlighted != Some(selection);
        self.highlighted = Some(selection);
        changed
    }

    /// Resolve the highlighted entry
    #[must_use]
    pub fn confirm(&self) -> Option<MenuChoice<'_>> {
        match self.highlighted? {
            Selection::Back => Some(MenuChoice::Back),
            Selection::Item(index) => self.catalog.get(index).map(MenuChoice::Car),
        }
    }

    #[must_use]
    pub fn highlighted(&self) -> Option<Selection> {
        self.highlighted
    }

    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Menu lines in display order, back entry last
    #[must_use]
    pub fn entries(&self) -> Vec<MenuEntry> {
        if self.catalog.is_empty() {
            return Vec::new();
        }
        let mut lines: Vec<MenuEntry> = self
            .catalog
            .iter()
            .enumerate()
            .map(|(index, car)| MenuEntry {
                ordinal: index + 1,
                label: car.name.clone(),
                description: car.description.clone(),
                highlighted: self.highlighted == Some(Selection::Item(index)),
            })
            .collect();
        lines.push(MenuEntry {
            ordinal: BACK_ORDINAL,
            label: "VOLVER AL LOGIN".to_string(),
            description: String::new(),
            highlighted: self.highlighted == Some(Selection::Back),
        });
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::default_cars;
    use proptest::prelude::*;

    fn menu() -> MenuModel {
        MenuModel::new(Catalog::new("assets", default_cars()).unwrap())
    }

    fn empty_menu() -> MenuModel {
        MenuModel::new(Catalog::new("assets", Vec::new()).unwrap())
    }

    #[test]
    fn test_initial_highlight_is_first_item() {
        let menu = menu();
        assert_eq!(menu.highlighted(), Some(Selection::Item(0)));
        match menu.confirm() {
            Some(MenuChoice::Car(car)) => assert_eq!(car.key, "ferrari"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_select_in_range() {
        let mut menu = menu();
        assert!(menu.select(2));
        assert_eq!(menu.highlighted(), Some(Selection::Item(1)));
        assert!(!menu.select(2));
    }

    #[test]
    fn test_select_out_of_range_is_noop() {
        let mut menu = menu();
        menu.select(2);
        assert!(!menu.select(3));
        assert!(!menu.select(9));
        assert_eq!(menu.highlighted(), Some(Selection::Item(1)));
    }

    #[test]
    fn test_back_ordinal() {
        let mut menu = menu();
        menu.select(0);
        assert_eq!(menu.confirm(), Some(MenuChoice::Back));
        menu.reset();
        assert_eq!(menu.highlighted(), Some(Selection::Item(0)));
    }

    #[test]
    fn test_empty_catalog_confirms_nothing() {
        let mut menu = empty_menu();
        assert!(menu.confirm().is_none());
        for ordinal in 0..10 {
            assert!(!menu.select(ordinal));
            assert!(menu.confirm().is_none());
        }
        assert!(menu.entries().is_empty());
    }

    #[test]
    fn test_entries_mark_highlight() {
        let mut menu = menu();
        menu.select(0);
        let entries = menu.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].ordinal, 1);
        assert_eq!(entries[0].label, "Ferrari F40");
        assert!(!entries[0].highlighted);
        assert_eq!(entries[2].ordinal, 0);
        assert_eq!(entries[2].label, "VOLVER AL LOGIN");
        assert!(entries[2].highlighted);
    }

    proptest! {
        #[test]
        fn prop_highlight_stays_in_bounds(ordinals in proptest::collection::vec(0usize..20, 0..30)) {
            let mut menu = menu();
            for ordinal in ordinals {
                menu.select(ordinal);
                match menu.highlighted() {
                    Some(Selection::Item(index)) => prop_assert!(index < menu.catalog().len()),
                    Some(Selection::Back) => {}
                    None => prop_assert!(false, "non-empty menu lost its highlight"),
                }
            }
        }
    }
}
