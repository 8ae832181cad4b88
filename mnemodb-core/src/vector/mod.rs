pub mod distance;

pub use distance::{
    centroid_of, cosine_distance, cosine_similarity, l2_distance, squared_l2_distance,
    weighted_mean,
};
