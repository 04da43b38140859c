use std::collections::BTreeMap;

/// Metadata about the pod requesting a slot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PodContext {
    pub namespace: String,
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub owner_references: Vec<OwnerRef>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerRef {
    pub kind: String,
    pub name: String,
    pub controller: bool,
}

// === impl PodContext ===

impl PodContext {
    /// Returns the owner that manages this pod.
    ///
    /// Prefers the reference flagged as controller and otherwise falls back to
    /// the first owner, which is how workload controllers populate the list.
    pub fn controller(&self) -> Option<&OwnerRef> {
        self.owner_references
            .iter()
            .find(|o| o.controller)
            .or_else(|| self.owner_references.first())
    }

    /// Returns the controller kind if it appears in `kinds` (case-insensitive).
    pub fn exempt_kind<'k>(&self, kinds: &'k [String]) -> Option<&'k str> {
        let owner = self.controller()?;
        kinds
            .iter()
            .find(|k| k.eq_ignore_ascii_case(&owner.kind))
            .map(String::as_str)
    }
}
