pub mod guest;
pub mod host;
pub mod segmentation;
pub mod support;
pub mod vmcs;
pub mod vmerror;
pub mod vmstack;
pub mod vmxon;
