use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(super) struct GqlResponse {
    pub data: Option<StreamMetadataData>,
}

#[derive(Debug, Deserialize)]
pub(super) struct StreamMetadataData {
    pub user: Option<User>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct User {
    pub stream: Option<serde_json::Value>,
    pub last_broadcast: Option<LastBroadcast>,
}

#[derive(Debug, Deserialize)]
pub(super) struct LastBroadcast {
    pub title: Option<String>,
}
