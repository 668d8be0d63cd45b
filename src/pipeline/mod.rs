//! Request-serving pipelines. MP4/byte-range is the base pipeline (4.F);
//! HLS (4.G) delegates segment bytes to it and only owns playlist
//! handling itself.

pub mod mp4;
