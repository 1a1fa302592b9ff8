// Contracts Module - Public ABIs Only

pub mod i_distributor;
pub mod i_launchpad;
pub mod i_taopad_token;

pub use i_distributor::IDistributor;
pub use i_launchpad::ILaunchpad;
pub use i_taopad_token::{ITaopadToken, TransferFilter};
