pub mod wire;
pub mod frame;
pub mod amsdu;
pub mod fw_msg;
