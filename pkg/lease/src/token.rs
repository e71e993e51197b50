use pkg_state::{Assert, Collection, Operation};
use pkg_types::lease::FIELD_HOLDER;

/// Proof obligation a caller merges into its own transaction so the write
/// only commits while the lease is still held by the expected holder.
#[derive(Debug, Clone, PartialEq)]
pub enum FencingAssertion {
    /// The lease document must exist and name `holder`.
    LeaseHeld {
        collection: Collection,
        id: String,
        holder: String,
    },
}

impl FencingAssertion {
    /// The assertion-only operation enforcing this fence.
    pub fn to_operation(&self) -> Operation {
        match self {
            FencingAssertion::LeaseHeld {
                collection,
                id,
                holder,
            } => Operation::new(*collection, id.clone())
                .assert(Assert::field_eq(FIELD_HOLDER, holder.as_str())),
        }
    }

    /// Prepend the fence to a caller's operations.
    pub fn merge_into(&self, ops: &mut Vec<Operation>) {
        ops.insert(0, self.to_operation());
    }
}
