//! # Internal Macros
//!
//! ## zerocopy_accessors!
//!
//! Generates getter and setter methods for header fields stored as zerocopy
//! little-endian `U32` values. Headers in this crate are always views into
//! mapped memory, so every generated setter writes straight into the mapped
//! bytes.
//!
//! ```ignore
//! #[repr(C)]
//! struct ViewHeader {
//!     free_space: U32,
//! }
//!
//! impl ViewHeader {
//!     zerocopy_accessors! {
//!         free_space: u32,
//!     }
//! }
//!
//! // Generates:
//! // pub fn free_space(&self) -> u32 { self.free_space.get() }
//! // pub fn set_free_space(&mut self, val: u32) { self.free_space = U32::new(val); }
//! ```

/// Generates getter and setter methods for zerocopy little-endian `u32` fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}
