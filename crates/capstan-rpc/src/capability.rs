//! Capability handles and the transforms that navigate promised answers.

/// A handle to a capability, tagged by the domain its id lives in.
///
/// Translation between these variants and wire cap-descriptors happens at
/// exactly two boundaries (outbound and inbound payload walks); both match
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    /// An object hosted by this vat, keyed into its local registry.
    Local { id: u64 },
    /// A capability the peer hosts; `id` is the peer's export id
    /// (our import table key).
    Remote { id: u32 },
    /// One of our own exports, handed back to us by the peer.
    Exported { id: u32 },
    /// A capability that does not exist yet.
    Promise {
        id: u32,
        variant: PromiseVariant,
        transform: Vec<TransformOp>,
    },
}

/// What a promise is waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromiseVariant {
    /// The answer the peer owes to one of our questions; `id` keys our
    /// question table.
    Answer,
    /// An answer this vat owes to one of the peer's questions; `id` keys
    /// our answer table. Produced by inbound `receiverAnswer` descriptors
    /// and promised-answer call targets.
    LocalAnswer,
    /// A promise the peer exported; calls are sent to its import id.
    Remote,
    /// A sender-promise import awaiting an explicit resolution.
    Resolve,
}

/// One navigation step applied to a resolved payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransformOp {
    Noop,
    /// Descend into pointer field `n` of the current struct.
    GetPointerField(u16),
}

impl Capability {
    /// A promise over the same target with further navigation appended.
    pub fn transformed(&self, extra: &[TransformOp]) -> Option<Capability> {
        match self {
            Capability::Promise { id, variant, transform } => {
                let mut t = transform.clone();
                t.extend_from_slice(extra);
                Some(Capability::Promise {
                    id: *id,
                    variant: *variant,
                    transform: t,
                })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transformed_extends_the_path() {
        let p = Capability::Promise {
            id: 4,
            variant: PromiseVariant::Answer,
            transform: vec![TransformOp::GetPointerField(0)],
        };
        let q = p.transformed(&[TransformOp::GetPointerField(2)]).unwrap();
        assert_eq!(
            q,
            Capability::Promise {
                id: 4,
                variant: PromiseVariant::Answer,
                transform: vec![
                    TransformOp::GetPointerField(0),
                    TransformOp::GetPointerField(2)
                ],
            }
        );
        assert!(Capability::Remote { id: 1 }.transformed(&[]).is_none());
    }
}
