//! Raw FFI bindings to the llama.cpp C API, generated by bindgen at build
//! time. Everything here is `unsafe`; `llama-bridge` is the safe layer.

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(dead_code)]
#![allow(clippy::all)]

include!(concat!(env!("OUT_DIR"), "/bindings.rs"));
