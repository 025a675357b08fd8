pub mod mock_sink;
