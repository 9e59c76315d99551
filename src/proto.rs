//! Structured message payloads exchanged with the pipeline.
//!
//! Messages cross the boundary in their serialized wire form and are decoded
//! with `prost` on the managed side.

/// A message type with the name the pipeline registers it under.
pub trait NamedMessage: prost::Message + Default {
    const TYPE_NAME: &'static str;
}

macro_rules! named_message {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(impl NamedMessage for $ty {
            const TYPE_NAME: &'static str = $name;
        })*
    };
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Landmark {
    #[prost(float, tag = "1")]
    pub x: f32,
    #[prost(float, tag = "2")]
    pub y: f32,
    #[prost(float, tag = "3")]
    pub z: f32,
    #[prost(float, optional, tag = "4")]
    pub visibility: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub presence: Option<f32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LandmarkList {
    #[prost(message, repeated, tag = "1")]
    pub landmark: Vec<Landmark>,
}

/// Landmark with coordinates normalized to `[0, 1]` by image size.
#[derive(Clone, PartialEq, prost::Message)]
pub struct NormalizedLandmark {
    #[prost(float, tag = "1")]
    pub x: f32,
    #[prost(float, tag = "2")]
    pub y: f32,
    #[prost(float, tag = "3")]
    pub z: f32,
    #[prost(float, optional, tag = "4")]
    pub visibility: Option<f32>,
    #[prost(float, optional, tag = "5")]
    pub presence: Option<f32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NormalizedLandmarkList {
    #[prost(message, repeated, tag = "1")]
    pub landmark: Vec<NormalizedLandmark>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Classification {
    #[prost(int32, tag = "1")]
    pub index: i32,
    #[prost(float, tag = "2")]
    pub score: f32,
    #[prost(string, optional, tag = "3")]
    pub label: Option<String>,
    #[prost(string, optional, tag = "4")]
    pub display_name: Option<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ClassificationList {
    #[prost(message, repeated, tag = "1")]
    pub classification: Vec<Classification>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Rect {
    #[prost(int32, tag = "1")]
    pub x_center: i32,
    #[prost(int32, tag = "2")]
    pub y_center: i32,
    #[prost(int32, tag = "3")]
    pub height: i32,
    #[prost(int32, tag = "4")]
    pub width: i32,
    #[prost(float, optional, tag = "5")]
    pub rotation: Option<f32>,
    #[prost(int64, optional, tag = "6")]
    pub rect_id: Option<i64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct NormalizedRect {
    #[prost(float, tag = "1")]
    pub x_center: f32,
    #[prost(float, tag = "2")]
    pub y_center: f32,
    #[prost(float, tag = "3")]
    pub height: f32,
    #[prost(float, tag = "4")]
    pub width: f32,
    #[prost(float, optional, tag = "5")]
    pub rotation: Option<f32>,
    #[prost(int64, optional, tag = "6")]
    pub rect_id: Option<i64>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RelativeBoundingBox {
    #[prost(float, tag = "1")]
    pub xmin: f32,
    #[prost(float, tag = "2")]
    pub ymin: f32,
    #[prost(float, tag = "3")]
    pub width: f32,
    #[prost(float, tag = "4")]
    pub height: f32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RelativeKeypoint {
    #[prost(float, tag = "1")]
    pub x: f32,
    #[prost(float, tag = "2")]
    pub y: f32,
    #[prost(string, optional, tag = "3")]
    pub keypoint_label: Option<String>,
    #[prost(float, optional, tag = "4")]
    pub score: Option<f32>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LocationData {
    #[prost(message, optional, tag = "3")]
    pub relative_bounding_box: Option<RelativeBoundingBox>,
    #[prost(message, repeated, tag = "5")]
    pub relative_keypoints: Vec<RelativeKeypoint>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Detection {
    #[prost(string, repeated, tag = "1")]
    pub label: Vec<String>,
    #[prost(int32, repeated, tag = "2")]
    pub label_id: Vec<i32>,
    #[prost(float, repeated, tag = "3")]
    pub score: Vec<f32>,
    #[prost(message, optional, tag = "4")]
    pub location_data: Option<LocationData>,
    #[prost(int64, optional, tag = "6")]
    pub detection_id: Option<i64>,
}

named_message! {
    Landmark => "mediapipe.Landmark",
    LandmarkList => "mediapipe.LandmarkList",
    NormalizedLandmark => "mediapipe.NormalizedLandmark",
    NormalizedLandmarkList => "mediapipe.NormalizedLandmarkList",
    Classification => "mediapipe.Classification",
    ClassificationList => "mediapipe.ClassificationList",
    Rect => "mediapipe.Rect",
    NormalizedRect => "mediapipe.NormalizedRect",
    LocationData => "mediapipe.LocationData",
    Detection => "mediapipe.Detection",
}

crate::packet::message_payload!(
    Landmark,
    LandmarkList,
    NormalizedLandmark,
    NormalizedLandmarkList,
    Classification,
    ClassificationList,
    Rect,
    NormalizedRect,
    LocationData,
    Detection,
);
