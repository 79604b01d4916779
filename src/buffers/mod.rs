pub mod buf_ext;
pub mod buffer_pool;
pub mod zero_coding;
