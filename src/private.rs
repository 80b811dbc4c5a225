pub use memoffset::offset_of;
pub use smallvec::smallvec;
