pub mod denoise_paired;
