//! Named protein-id lists with filter state.
//!
//! A [`SelectionSession`] owns the search lists of one dataset. Every
//! mutating operation takes the dataset's [`DatasetSelections`] explicitly
//! and writes the change through to its selection map and color table.

use std::collections::{BTreeSet, HashSet};

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{HexColor, SearchType};
use crate::error::KiraError;
use crate::palette::{PaletteAllocator, UsedColors, default_palette};
use crate::selection::{DatasetSelections, SelectionMap};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchList {
    pub id: Uuid,
    pub name: String,
    pub color: HexColor,
    pub protein_ids: IndexSet<String>,
    #[serde(default)]
    pub search_terms: Vec<String>,
    pub search_type: SearchType,
    #[serde(default)]
    pub description: Option<String>,
}

/// Input to [`SelectionSession::create`].
#[derive(Debug, Clone)]
pub struct NewSearchList {
    pub name: String,
    /// Allocated from the palette when absent.
    pub color: Option<HexColor>,
    pub protein_ids: Vec<String>,
    pub search_terms: Vec<String>,
    pub search_type: SearchType,
    pub description: Option<String>,
}

/// Persisted companion of a selection map; enough to rebuild the lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchListManifest {
    #[serde(default)]
    pub lists: Vec<SearchList>,
    #[serde(default)]
    pub active_filters: Vec<Uuid>,
    #[serde(default)]
    pub active_stored: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SelectionSession {
    lists: IndexMap<Uuid, SearchList>,
    active_filters: BTreeSet<Uuid>,
    active_stored: BTreeSet<String>,
}

impl SelectionSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lists(&self) -> impl Iterator<Item = &SearchList> {
        self.lists.values()
    }

    pub fn get(&self, id: Uuid) -> Result<&SearchList, KiraError> {
        self.lists.get(&id).ok_or(KiraError::SearchListNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn active_filters(&self) -> &BTreeSet<Uuid> {
        &self.active_filters
    }

    pub fn is_active(&self, id: Uuid) -> bool {
        self.active_filters.contains(&id)
    }

    /// Adds a list and activates its filter. A list whose name is already
    /// taken is merged into the existing one.
    pub fn create(&mut self, dataset: &mut DatasetSelections, new: NewSearchList) -> Uuid {
        if let Some(existing) = self.lists.values_mut().find(|list| list.name == new.name) {
            for protein in &new.protein_ids {
                if existing.protein_ids.insert(protein.clone()) {
                    dataset.selections.insert(protein, &existing.name);
                }
            }
            for term in new.search_terms {
                if !existing.search_terms.contains(&term) {
                    existing.search_terms.push(term);
                }
            }
            let id = existing.id;
            debug!(list = %new.name, %id, "merged into existing search list");
            self.active_filters.insert(id);
            return id;
        }

        let color = match new.color {
            Some(color) => color,
            None => self.next_color(dataset),
        };
        let list = SearchList {
            id: Uuid::new_v4(),
            name: new.name,
            color,
            protein_ids: new.protein_ids.into_iter().collect(),
            search_terms: new.search_terms,
            search_type: new.search_type,
            description: new.description,
        };
        for protein in &list.protein_ids {
            dataset.selections.insert(protein, &list.name);
        }
        dataset.colors.insert(list.name.clone(), list.color.clone());
        debug!(
            dataset = %dataset.dataset,
            list = %list.name,
            proteins = list.protein_ids.len(),
            "created search list"
        );
        let id = list.id;
        self.lists.insert(id, list);
        self.active_filters.insert(id);
        id
    }

    fn next_color(&self, dataset: &DatasetSelections) -> HexColor {
        let used = UsedColors {
            reserved: dataset.colors.values().cloned().collect(),
            assigned: self.lists.values().map(|list| list.color.clone()).collect(),
        };
        PaletteAllocator::new(default_palette()).allocate_next(&used)
    }

    pub fn remove(
        &mut self,
        dataset: &mut DatasetSelections,
        id: Uuid,
    ) -> Result<SearchList, KiraError> {
        let list = self
            .lists
            .shift_remove(&id)
            .ok_or(KiraError::SearchListNotFound(id))?;
        self.active_filters.remove(&id);
        dataset.selections.remove_selection(&list.name);
        dataset.colors.remove(&list.name);
        Ok(list)
    }

    /// Fails with [`KiraError::SelectionNameTaken`] when `name` belongs to
    /// another list or to a stored selection.
    pub fn rename(
        &mut self,
        dataset: &mut DatasetSelections,
        id: Uuid,
        name: &str,
    ) -> Result<(), KiraError> {
        let current = self.get(id)?.name.clone();
        if current == name {
            return Ok(());
        }
        let taken = self.lists.values().any(|list| list.name == name)
            || dataset.selections.selection_names().contains(name)
            || dataset.colors.contains_key(name);
        if taken {
            return Err(KiraError::SelectionNameTaken(name.to_string()));
        }
        let list = self
            .lists
            .get_mut(&id)
            .ok_or(KiraError::SearchListNotFound(id))?;
        dataset.selections.remove_selection(&list.name);
        for protein in &list.protein_ids {
            dataset.selections.insert(protein, name);
        }
        if let Some(color) = dataset.colors.remove(&list.name) {
            dataset.colors.insert(name.to_string(), color);
        }
        list.name = name.to_string();
        Ok(())
    }

    pub fn recolor(
        &mut self,
        dataset: &mut DatasetSelections,
        id: Uuid,
        color: HexColor,
    ) -> Result<(), KiraError> {
        let list = self
            .lists
            .get_mut(&id)
            .ok_or(KiraError::SearchListNotFound(id))?;
        dataset.colors.insert(list.name.clone(), color.clone());
        list.color = color;
        Ok(())
    }

    /// Flips the filter for one list, returning whether it is now active.
    pub fn toggle_filter(&mut self, id: Uuid) -> Result<bool, KiraError> {
        if !self.lists.contains_key(&id) {
            return Err(KiraError::SearchListNotFound(id));
        }
        if self.active_filters.remove(&id) {
            Ok(false)
        } else {
            self.active_filters.insert(id);
            Ok(true)
        }
    }

    /// Replaces the active filter set. Nothing changes if any id is unknown.
    pub fn set_filters<I>(&mut self, ids: I) -> Result<(), KiraError>
    where
        I: IntoIterator<Item = Uuid>,
    {
        let ids = ids.into_iter().collect::<BTreeSet<_>>();
        if let Some(unknown) = ids.iter().find(|id| !self.lists.contains_key(*id)) {
            return Err(KiraError::SearchListNotFound(*unknown));
        }
        self.active_filters = ids;
        Ok(())
    }

    /// Activates a selection that lives only in the selection map, such as a
    /// saved volcano group.
    pub fn toggle_stored_filter(&mut self, name: &str) -> bool {
        if self.active_stored.remove(name) {
            false
        } else {
            self.active_stored.insert(name.to_string());
            true
        }
    }

    pub fn set_stored_filters<I, S>(&mut self, names: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.active_stored = names.into_iter().map(Into::into).collect();
    }

    /// Drops every list and filter, removing the lists' tags from the dataset.
    pub fn clear_all(&mut self, dataset: &mut DatasetSelections) {
        for list in self.lists.values() {
            dataset.selections.remove_selection(&list.name);
            dataset.colors.remove(&list.name);
        }
        self.lists.clear();
        self.active_filters.clear();
        self.active_stored.clear();
    }

    /// Union of active lists and active stored selections, in first-seen order.
    pub fn filtered_protein_ids(&self, stored: &SelectionMap) -> IndexSet<String> {
        let mut proteins = IndexSet::new();
        for list in self.lists.values() {
            if self.active_filters.contains(&list.id) {
                proteins.extend(list.protein_ids.iter().cloned());
            }
        }
        for name in &self.active_stored {
            proteins.extend(stored.proteins_with(name).map(str::to_string));
        }
        proteins
    }

    /// Folds the lists into `base`. Entries under a current list name are
    /// replaced by the list, every other entry is kept.
    pub fn export(&self, base: &SelectionMap) -> SelectionMap {
        let mut exported = base.clone();
        for list in self.lists.values() {
            exported.remove_selection(&list.name);
        }
        for list in self.lists.values() {
            for protein in &list.protein_ids {
                exported.insert(protein, &list.name);
            }
        }
        exported.strip_empty();
        exported
    }

    pub fn manifest(&self) -> SearchListManifest {
        SearchListManifest {
            lists: self.lists.values().cloned().collect(),
            active_filters: self.active_filters.iter().copied().collect(),
            active_stored: self.active_stored.iter().cloned().collect(),
        }
    }

    /// Rebuilds lists from a persisted map. Membership comes from `map`; the
    /// manifest contributes identity, metadata and protein order.
    pub fn import(map: &SelectionMap, manifest: &SearchListManifest) -> Self {
        let mut session = Self::new();
        for stored in &manifest.lists {
            let members = map.proteins_with(&stored.name).collect::<HashSet<_>>();
            let mut protein_ids = stored
                .protein_ids
                .iter()
                .filter(|protein| members.contains(protein.as_str()))
                .cloned()
                .collect::<IndexSet<_>>();
            let mut added = map
                .proteins_with(&stored.name)
                .filter(|protein| !protein_ids.contains(*protein))
                .map(str::to_string)
                .collect::<Vec<_>>();
            added.sort();
            protein_ids.extend(added);
            session.lists.insert(
                stored.id,
                SearchList {
                    protein_ids,
                    ..stored.clone()
                },
            );
        }
        for id in &manifest.active_filters {
            if session.lists.contains_key(id) {
                session.active_filters.insert(*id);
            } else {
                warn!(%id, "dropping filter for unknown search list");
            }
        }
        let names = map.selection_names();
        session.active_stored = manifest
            .active_stored
            .iter()
            .filter(|name| names.contains(name.as_str()))
            .cloned()
            .collect();
        session
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::DatasetId;

    fn dataset() -> DatasetSelections {
        DatasetSelections::new("lfq".parse::<DatasetId>().unwrap())
    }

    fn new_list(name: &str, proteins: &[&str]) -> NewSearchList {
        NewSearchList {
            name: name.to_string(),
            color: None,
            protein_ids: proteins.iter().map(|p| p.to_string()).collect(),
            search_terms: proteins.iter().map(|p| p.to_string()).collect(),
            search_type: SearchType::PrimaryId,
            description: None,
        }
    }

    #[test]
    fn create_writes_through_and_activates() {
        let mut data = dataset();
        let mut session = SelectionSession::new();
        let id = session.create(&mut data, new_list("Kinases", &["P2", "P1"]));

        assert!(session.is_active(id));
        assert!(data.selections.contains("P1", "Kinases"));
        assert_eq!(data.colors["Kinases"], session.get(id).unwrap().color);
        let order = session.get(id).unwrap().protein_ids.iter().cloned().collect::<Vec<_>>();
        assert_eq!(order, vec!["P2", "P1"]);
    }

    #[test]
    fn allocated_colors_are_distinct() {
        let mut data = dataset();
        let mut session = SelectionSession::new();
        let a = session.create(&mut data, new_list("A", &["P1"]));
        let b = session.create(&mut data, new_list("B", &["P2"]));
        assert_ne!(session.get(a).unwrap().color, session.get(b).unwrap().color);
    }

    #[test]
    fn duplicate_name_merges() {
        let mut data = dataset();
        let mut session = SelectionSession::new();
        let first = session.create(&mut data, new_list("A", &["P1"]));
        let second = session.create(&mut data, new_list("A", &["P2", "P1"]));
        assert_eq!(first, second);
        assert_eq!(session.len(), 1);
        assert_eq!(session.get(first).unwrap().protein_ids.len(), 2);
    }

    #[test]
    fn rename_recolor_remove() {
        let mut data = dataset();
        let mut session = SelectionSession::new();
        let id = session.create(&mut data, new_list("A", &["P1"]));

        session.rename(&mut data, id, "B").unwrap();
        assert!(data.selections.contains("P1", "B"));
        assert!(!data.selections.contains("P1", "A"));
        assert!(data.colors.contains_key("B"));

        let black: HexColor = "#000000".parse().unwrap();
        session.recolor(&mut data, id, black.clone()).unwrap();
        assert_eq!(data.colors["B"], black);

        let removed = session.remove(&mut data, id).unwrap();
        assert_eq!(removed.name, "B");
        assert!(data.selections.is_empty());
        assert!(session.active_filters().is_empty());
        assert_matches!(
            session.remove(&mut data, id),
            Err(KiraError::SearchListNotFound(missing)) if missing == id
        );
    }

    #[test]
    fn rename_rejects_names_in_use() {
        let mut data = dataset();
        data.selections.insert("P9", "Volcano hits (1)");
        let mut session = SelectionSession::new();
        let a = session.create(&mut data, new_list("A", &["P1"]));
        let b = session.create(&mut data, new_list("B", &["P2"]));
        let before = data.clone();

        assert_matches!(
            session.rename(&mut data, a, "B"),
            Err(KiraError::SelectionNameTaken(name)) if name == "B"
        );
        assert_matches!(
            session.rename(&mut data, a, "Volcano hits (1)"),
            Err(KiraError::SelectionNameTaken(_))
        );
        assert_eq!(data, before);
        assert_eq!(session.get(a).unwrap().name, "A");

        session.remove(&mut data, a).unwrap();
        assert!(data.selections.contains("P2", "B"));
        assert!(data.selections.contains("P9", "Volcano hits (1)"));
        assert_eq!(data.colors["B"], session.get(b).unwrap().color);
        session.rename(&mut data, b, "B").unwrap();
    }

    #[test]
    fn stored_filters_are_replaced_wholesale() {
        let mut data = dataset();
        data.selections.insert("P1", "Up (1)");
        data.selections.insert("P2", "Down (1)");
        let mut session = SelectionSession::new();
        session.toggle_stored_filter("Up (1)");
        session.set_stored_filters(["Down (1)"]);
        let ids = session.filtered_protein_ids(&data.selections);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["P2"]);
    }

    #[test]
    fn filters_union_lists_and_stored_selections() {
        let mut data = dataset();
        data.selections.insert("P9", "P-value <= 0.05; FC > 0.6 (1)");
        let mut session = SelectionSession::new();
        let a = session.create(&mut data, new_list("A", &["P1", "P2"]));
        let b = session.create(&mut data, new_list("B", &["P3"]));

        session.set_filters([a]).unwrap();
        session.toggle_stored_filter("P-value <= 0.05; FC > 0.6 (1)");
        let ids = session.filtered_protein_ids(&data.selections);
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["P1", "P2", "P9"]);

        assert!(session.toggle_filter(b).unwrap());
        assert!(!session.toggle_filter(a).unwrap());
        let ids = session.filtered_protein_ids(&data.selections);
        assert!(ids.contains("P3") && !ids.contains("P1"));

        assert_matches!(
            session.set_filters([a, Uuid::new_v4()]),
            Err(KiraError::SearchListNotFound(_))
        );
        assert!(session.is_active(b));
    }

    #[test]
    fn export_replaces_only_list_owned_entries() {
        let mut base = SelectionMap::new();
        base.insert("P1", "Volcano group");
        base.insert("P1", "A");
        base.insert("P5", "A");

        let mut data = dataset();
        let mut session = SelectionSession::new();
        session.create(&mut data, new_list("A", &["P2"]));

        let exported = session.export(&base);
        assert!(exported.contains("P1", "Volcano group"));
        assert!(!exported.contains("P1", "A"));
        assert!(exported.contains("P2", "A"));
        assert!(!exported.contains("P5", "A"));
        assert_eq!(exported.len(), 2);
    }

    #[test]
    fn export_import_round_trip() {
        let mut base = SelectionMap::new();
        base.insert("P7", "P-value > 0.05; FC <= 0.6 (1)");
        let mut data = DatasetSelections {
            selections: base.clone(),
            ..dataset()
        };
        let mut session = SelectionSession::new();
        let a = session.create(&mut data, new_list("A", &["P3", "P1"]));
        let b = session.create(&mut data, new_list("B", &["P2", "P7"]));
        session.toggle_filter(b).unwrap();

        let exported = session.export(&base);
        assert_eq!(exported, data.selections);
        let restored = SelectionSession::import(&exported, &session.manifest());

        assert_eq!(restored.len(), 2);
        assert_eq!(restored.get(a).unwrap().protein_ids, session.get(a).unwrap().protein_ids);
        assert_eq!(restored.get(b).unwrap().protein_ids, session.get(b).unwrap().protein_ids);
        assert_eq!(restored.active_filters(), session.active_filters());
        assert!(restored.export(&exported).contains("P7", "P-value > 0.05; FC <= 0.6 (1)"));
        assert_eq!(restored.export(&exported), exported);
    }

    #[test]
    fn clear_all_keeps_stored_selections() {
        let mut data = dataset();
        data.selections.insert("P9", "Stored");
        let mut session = SelectionSession::new();
        session.create(&mut data, new_list("A", &["P1", "P9"]));
        session.clear_all(&mut data);
        assert!(session.is_empty());
        assert_eq!(data.selections.len(), 1);
        assert!(data.selections.contains("P9", "Stored"));
        assert!(data.colors.is_empty());
    }
}
