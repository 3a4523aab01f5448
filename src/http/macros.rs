/// Declares a handler for `/interfaces/{name}/...` that looks the interface up, then runs `$call`
/// with its sender (and the JSON body, when a request type is given).
#[macro_export]
macro_rules! http_interface_handler {
    (
        $fn_name:ident,
        $response_type:ty,
        |$sender:ident| $call:block
    ) => {
        pub async fn $fn_name(
            axum::extract::State(state): axum::extract::State<HttpState>,
            axum::extract::Path(name): axum::extract::Path<String>
        ) -> $crate::http::types::JsonResult<$response_type> {
            async fn inner(
                $sender: $crate::modem::sender::InterfaceSender
            ) -> anyhow::Result<$response_type> {
                $call
            }

            let sender = $crate::http::find_interface(&state, &name).await?;
            $crate::http::into_json_result(inner(sender).await)
        }
    };
    (
        $fn_name:ident,
        $request_type:ty,
        $response_type:ty,
        |$sender:ident, $payload:ident| $call:block
    ) => {
        pub async fn $fn_name(
            axum::extract::State(state): axum::extract::State<HttpState>,
            axum::extract::Path(name): axum::extract::Path<String>,
            axum::Json($payload): axum::Json<$request_type>
        ) -> $crate::http::types::JsonResult<$response_type> {
            async fn inner(
                $sender: $crate::modem::sender::InterfaceSender,
                $payload: $request_type
            ) -> anyhow::Result<$response_type> {
                $call
            }

            let sender = $crate::http::find_interface(&state, &name).await?;
            $crate::http::into_json_result(inner(sender, $payload).await)
        }
    };
}
