//! Matrix Audio Library
//!
//! Real-time audio spectrum analysis for LED matrix visualizers: a capture
//! thread turns microphone blocks into 64 smoothed bar heights with held
//! peaks, and the render side reads them together with beat and tempo
//! estimates without ever waiting on audio I/O.

pub mod audio;
