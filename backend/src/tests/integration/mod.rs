mod api_evaluate;
mod api_exceptions;
