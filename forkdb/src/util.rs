use ulid::Ulid;

/// Fresh identifier for entities and versions. Ulids sort by creation
/// time, which keeps version listings naturally ordered.
pub(crate) fn new_id() -> String {
    Ulid::new().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_sortable() {
        let a = new_id();
        let b = new_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 26);
    }
}
