use smol_str::SmolStr;
use uuid::Uuid;

/// Source of process-unique identifiers: array element `_key`s and
/// transaction ids. Injectable so tests can supply deterministic keys.
///
/// Keys are assigned when an edit is staged, never when a patch literal is
/// constructed, so two sessions staging structurally identical inserts can
/// never collide on key identity.
pub trait KeyGenerator: Send + Sync {
    fn generate(&self) -> SmolStr;
}

/// Random 12-hex-character keys drawn from a v4 uuid.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomKeys;

impl KeyGenerator for RandomKeys {
    fn generate(&self) -> SmolStr {
        let id = Uuid::new_v4().simple().to_string();
        SmolStr::new(&id[..12])
    }
}
