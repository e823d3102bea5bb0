// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The `open_enum!` macro.

/// Declares an "open" enum: a transparent newtype over an integer with named
/// constants for the well-known values.
///
/// Unlike a Rust `enum`, an open enum can hold any value of its storage type,
/// which is what register fields read back from real hardware require. The
/// `Debug` impl prints the constant's name for known values and
/// `Name(0x..)` otherwise.
///
/// Values must be integer literals so they can double as match patterns.
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$attr:meta])*
        $vis:vis enum $name:ident : $storage:ty {
            $(
                $(#[$variant_attr:meta])*
                $variant:ident = $value:literal,
            )*
        }
    ) => {
        $(#[$attr])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis struct $name(pub $storage);

        #[allow(missing_docs)]
        impl $name {
            $(
                $(#[$variant_attr])*
                $vis const $variant: $name = $name($value);
            )*
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                #[allow(unreachable_patterns)]
                match self.0 {
                    $($value => f.pad(stringify!($variant)),)*
                    _ => write!(f, concat!(stringify!($name), "({:#x})"), self.0),
                }
            }
        }

        impl ::core::convert::From<$storage> for $name {
            fn from(value: $storage) -> Self {
                Self(value)
            }
        }

        impl ::core::convert::From<$name> for $storage {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}
