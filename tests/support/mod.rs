pub mod mock_executor;
