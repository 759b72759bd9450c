mod collinfo;
mod ctx_decrypt;
