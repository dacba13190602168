pub mod logging;
pub mod settings;

use derive_more::{Display, From};
use uuid::Uuid;

#[derive(
    Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Copy, Clone, Display, From, Serialize, Deserialize,
)]
/// The index of a client in the federation, in `0..num_clients`.
pub struct ClientId(pub u32);

impl ClientId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Eq, PartialEq, Hash, Debug, Copy, Clone, Display, Serialize, Deserialize)]
/// A unique random token handed to a rank when it joins the federation
pub struct Token(Uuid);

impl Token {
    /// Return a new random token
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for Token {
    fn default() -> Self {
        Self::new()
    }
}
