use crate::openai::list_response_items::types::{ItemResource, ResponseItemListObjectType};

pub type ListInputItemsResponse = crate::openai::list_response_items::ResponseItemList;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_empty_input_item_list() {
        let json = r#"{"object":"list","data":[],"first_id":"","last_id":"","has_more":false}"#;
        let parsed: ListInputItemsResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.object, ResponseItemListObjectType::List);
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn matches_response_item_list_shape() {
        let _: fn(&ItemResource) -> bool = |_| true;
    }
}
