pub mod appearance;
pub mod realm;
pub mod vector;

pub use appearance::{NodeAppearance, TrustLevel};
pub use realm::{MemberRecord, RealmPopulation};
pub use vector::VectorHelper;
