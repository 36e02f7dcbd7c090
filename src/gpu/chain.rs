// Copyright 2025 the vkenc authors
//
// SPDX-License-Identifier: MIT

/// Builds a pinned chain of Vulkan structures.
///
/// Ash's builder pattern works well for temporary structs on the stack,
/// but a `p_next` chain stored for re-use is self-referential, so the
/// holding struct must be pinned on the heap. This macro generates:
///
///  - a constructor returning the pinned chain, with `p_next` pointers
///    wired up in declaration order (the first field is the head),
///  - `AsRef`/`AsMut` to the head struct, so calling code can take an
///    `impl AsMut<T>` and stay generic over the rest of the chain,
///  - `Deref` to the inner struct for field access.
macro_rules! vk_chain {
    (
        $(#[$meta:meta])*
        $vis:vis struct $Chain:ident <$lifetime:lifetime> {
            $(#[$head_meta:meta])*
            pub $HeadName:ident: $HeadStruct:ty,
            $(
                $(#[$field_meta:meta])*
                pub $Name:ident: $Struct:ty,
            )+
        }
    ) => {
        paste::paste! {
            $(#[$meta])*
            $vis struct [<$Chain Inner>] <$lifetime> {
                $(#[$head_meta])*
                pub $HeadName: $HeadStruct,
                $(
                    $(#[$field_meta])*
                    pub $Name: $Struct,
                )*
            }

            $vis struct $Chain(std::pin::Pin<Box<[<$Chain Inner>] <'static> >>);

            unsafe impl Send for $Chain {}

            #[allow(dead_code)]
            impl $Chain {
                pub fn new<$lifetime: 'static>($HeadName: $HeadStruct, $($Name: $Struct,)*) -> Self {
                    let mut ch = Box::pin([<$Chain Inner>] {
                        $HeadName,
                        $($Name,)*
                    });

                    $crate::gpu::__set_p_next!(ch, $HeadName, $($Name),*);
                    Self(ch)
                }
            }

            impl Default for $Chain {
                fn default() -> Self {
                    Self::new(
                        $crate::gpu::__replace_expr!($HeadStruct Default::default()),
                        $($crate::gpu::__replace_expr!($Struct Default::default()),)*
                    )
                }
            }

            impl std::ops::Deref for $Chain {
                type Target = [<$Chain Inner>]<'static>;

                fn deref(&self) -> &Self::Target {
                    std::pin::Pin::deref(&self.0)
                }
            }
        }

        impl<$lifetime: 'static> AsRef<$HeadStruct> for $Chain {
            fn as_ref(&self) -> &$HeadStruct {
                &self.0.as_ref().get_ref().$HeadName
            }
        }

        impl<$lifetime: 'static> AsMut<$HeadStruct> for $Chain {
            fn as_mut(&mut self) -> &mut $HeadStruct {
                // SAFETY: the chain is never moved out of its box, and
                // the head's fields other than p_next are free to
                // mutate.
                unsafe { &mut self.0.as_mut().get_unchecked_mut().$HeadName }
            }
        }
    };
}

macro_rules! __set_p_next(
    ($target:ident, $head:ident, $next:ident) => {
        unsafe {
            let inner = $target.as_mut().get_unchecked_mut();
            inner.$head.p_next = <*mut _>::cast(&mut inner.$next);
        }
    };
    ($target:ident, $head:ident, $next:ident, $($tail:ident),+) => {
        unsafe {
            let inner = $target.as_mut().get_unchecked_mut();
            inner.$head.p_next = <*mut _>::cast(&mut inner.$next);
        }
        $crate::gpu::__set_p_next!($target, $next, $($tail),+);
    };
);

macro_rules! __replace_expr {
    ($_t:tt $sub:expr) => {
        $sub
    };
}

pub(crate) use __replace_expr;
pub(crate) use __set_p_next;
pub(crate) use vk_chain;

#[cfg(test)]
mod test {
    use ash::vk;

    #[test]
    fn test_chain_links_p_next() {
        vk_chain! {
            pub struct EncodeProfile<'a> {
                pub profile: vk::VideoProfileInfoKHR<'a>,
                pub usage: vk::VideoEncodeUsageInfoKHR<'a>,
            }
        }

        let chain = EncodeProfile::new(
            vk::VideoProfileInfoKHR::default()
                .video_codec_operation(vk::VideoCodecOperationFlagsKHR::ENCODE_H264),
            vk::VideoEncodeUsageInfoKHR::default(),
        );

        assert_eq!(
            chain.profile.p_next,
            &chain.usage as *const _ as *const std::ffi::c_void
        );
        assert_eq!(
            chain.profile.video_codec_operation,
            vk::VideoCodecOperationFlagsKHR::ENCODE_H264
        );
    }
}
