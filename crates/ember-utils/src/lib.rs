mod assert;
mod percent;

pub use percent::{percent_decode, percent_decode_in_place, percent_encode};
