pub mod efficiency;
pub mod matchup;
pub mod predictor;
pub mod regression;
pub mod validation;
pub mod weights;

pub use efficiency::*;
pub use matchup::*;
pub use predictor::*;
pub use regression::*;
pub use validation::*;
pub use weights::*;
